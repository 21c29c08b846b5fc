use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::billing::models::LedgerReason;
use crate::billing::{BillingError, BillingService};
use crate::config;
use crate::db::{AuditStore, CabinetStore, EventStore, StoreError};
use crate::events::{Event, EventStatus, EventType, NewEvent, ReplyDraft};
use crate::llm::LlmAdapter;
use crate::marketplace::{ClientRegistry, RawEvent};
use crate::policy;
use crate::queue::{QueueClient, Task};

/// Failure taxonomy the retry loop keys off: transient failures are
/// redelivered with backoff, fatal ones surface immediately.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }

    fn fatal(err: impl Into<anyhow::Error>) -> Self {
        PipelineError::Fatal(err.into())
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            // Database blips and lost optimistic races are worth a redelivery.
            StoreError::Db(_) | StoreError::BalanceConflict(_) => PipelineError::Transient(err.into()),
            other => PipelineError::Fatal(other.into()),
        }
    }
}

impl From<BillingError> for PipelineError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Store(inner) => inner.into(),
            // Blocked or short balances do not heal by retrying the task.
            other => PipelineError::Fatal(other.into()),
        }
    }
}

/// key: pipeline -> stage orchestration over injected collaborators
///
/// Every stage re-validates the persisted event status before acting, so
/// at-least-once delivery never debits or sends twice.
pub struct Pipeline {
    billing: BillingService,
    events: Arc<dyn EventStore>,
    cabinets: Arc<dyn CabinetStore>,
    audit: Arc<dyn AuditStore>,
    registry: Arc<dyn ClientRegistry>,
    llm: Arc<dyn LlmAdapter>,
    queue: QueueClient,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        billing: BillingService,
        events: Arc<dyn EventStore>,
        cabinets: Arc<dyn CabinetStore>,
        audit: Arc<dyn AuditStore>,
        registry: Arc<dyn ClientRegistry>,
        llm: Arc<dyn LlmAdapter>,
        queue: QueueClient,
    ) -> Self {
        Self {
            billing,
            events,
            cabinets,
            audit,
            registry,
            llm,
            queue,
        }
    }

    pub async fn execute(&self, task: &Task) -> Result<(), PipelineError> {
        match task {
            Task::PollMarketplaces => self.poll_marketplaces().await,
            Task::IngestEvents {
                cabinet_id,
                payloads,
            } => self.ingest_events(*cabinet_id, payloads).await,
            Task::GenerateReply { event_id, owner_id } => {
                self.generate_reply(*event_id, *owner_id).await
            }
            Task::AutoSend { event_id } => self.auto_send(*event_id).await,
            Task::RetentionCleanup { retention_days } => {
                self.retention_cleanup(*retention_days).await
            }
        }
    }

    /// Sweeps every cabinet, fetching reviews and questions since the
    /// owner's eligibility window and handing the payloads to the ingest
    /// queue. Blocked owners are skipped entirely; their events wait on the
    /// marketplace until the balance is replenished.
    async fn poll_marketplaces(&self) -> Result<(), PipelineError> {
        let cabinets = self.cabinets.list_cabinets().await?;
        for cabinet in cabinets {
            let account = self.billing.account(cabinet.owner_id).await?;
            if let Err(err) = policy::guard_parsing(&account) {
                debug!(
                    owner_id = cabinet.owner_id,
                    cabinet_id = cabinet.id,
                    %err,
                    "skipping cabinet poll"
                );
                continue;
            }

            let window = policy::window_after_replenishment(&account);
            let client = self.registry.client_for(&cabinet);
            let reviews = client
                .fetch_reviews(window.start_time)
                .await
                .map_err(PipelineError::Transient)?;
            let questions = client
                .fetch_questions(window.start_time)
                .await
                .map_err(PipelineError::Transient)?;

            let payloads: Vec<RawEvent> = reviews
                .into_iter()
                .map(RawEvent::from)
                .chain(questions.into_iter().map(RawEvent::from))
                .collect();
            if payloads.is_empty() {
                continue;
            }

            info!(
                cabinet_id = cabinet.id,
                marketplace = cabinet.marketplace.as_str(),
                count = payloads.len(),
                include_backlog = window.include_backlog,
                "fetched marketplace events"
            );
            self.queue
                .enqueue(Task::IngestEvents {
                    cabinet_id: cabinet.id,
                    payloads,
                })
                .await
                .map_err(PipelineError::Transient)?;
        }
        Ok(())
    }

    /// Idempotent upsert of raw payloads; duplicates collapse silently and
    /// freshly created rows move on to generation. A duplicate still sitting
    /// in `New` is re-admitted when the owner's balance and eligibility
    /// window allow it; that is how a backlog-processing top-up reopens
    /// events that were blocked mid-batch.
    async fn ingest_events(&self, cabinet_id: i64, payloads: &[RawEvent]) -> Result<(), PipelineError> {
        let cabinet = self
            .cabinets
            .cabinet(cabinet_id)
            .await?
            .ok_or_else(|| PipelineError::fatal(StoreError::CabinetNotFound(cabinet_id)))?;
        let account = self.billing.account(cabinet.owner_id).await?;
        let owner_unblocked = policy::guard_parsing(&account).is_ok();
        let window = policy::window_after_replenishment(&account);

        let mut created_count = 0usize;
        let mut readmitted = 0usize;
        for raw in payloads {
            let new_event = NewEvent {
                project_id: cabinet.project_id,
                cabinet_id: cabinet.id,
                marketplace_event_id: raw.marketplace_event_id.clone(),
                marketplace: cabinet.marketplace,
                event_type: raw.event_type,
                text: raw.text.clone(),
                rating: raw.rating,
                sentiment: sentiment_for(raw.rating),
                raw_payload: raw.raw_payload.clone(),
            };
            let (event, created) = self.events.insert_or_fetch(new_event).await?;
            if created {
                created_count += 1;
            } else if owner_unblocked
                && event.status == EventStatus::New
                && window.admits(event.created_at)
            {
                readmitted += 1;
                debug!(
                    event_id = event.id,
                    external_id = %event.marketplace_event_id,
                    "re-admitting stored event to generation"
                );
            } else {
                debug!(
                    event_id = event.id,
                    external_id = %event.marketplace_event_id,
                    "duplicate event collapsed"
                );
                continue;
            }
            self.queue
                .enqueue(Task::GenerateReply {
                    event_id: event.id,
                    owner_id: cabinet.owner_id,
                })
                .await
                .map_err(PipelineError::Transient)?;
        }

        info!(
            cabinet_id,
            received = payloads.len(),
            created = created_count,
            readmitted,
            "ingested marketplace events"
        );
        Ok(())
    }

    /// Drafts a reply for a `New` event: guard, generate, debit, persist
    /// the draft, then gate it toward autosend, approval or escalation.
    async fn generate_reply(&self, event_id: i64, owner_id: i64) -> Result<(), PipelineError> {
        let event = self.load_event(event_id).await?;
        if event.status != EventStatus::New {
            info!(
                event_id,
                status = event.status.as_str(),
                "event already advanced, skipping generation"
            );
            return Ok(());
        }

        let account = self.billing.account(owner_id).await?;
        policy::guard_generation(&account)?;

        let reply = self
            .llm
            .generate(&build_prompt(&event))
            .await
            .map_err(PipelineError::Transient)?;

        self.billing
            .debit_tokens(
                owner_id,
                *config::GENERATION_COST_TOKENS,
                LedgerReason::Generation,
                Some(json!({ "event_id": event.id })),
            )
            .await?;

        let draft = ReplyDraft {
            suggested_reply: reply.text,
            confidence: reply.confidence,
            kb_rule_ids: reply.kb_rule_ids,
            conflict: reply.conflict,
        };
        if !self.events.store_draft(event.id, &draft).await? {
            warn!(event_id, "event advanced past new during generation");
            return Ok(());
        }

        if draft.conflict {
            self.events
                .transition(event.id, EventStatus::Drafted, EventStatus::Escalated)
                .await?;
            info!(event_id, "draft escalated, knowledge sources disagree");
        } else if policy::should_autosend_default(draft.confidence, draft.conflict) {
            info!(event_id, confidence = draft.confidence, "draft queued for autosend");
            self.queue
                .enqueue(Task::AutoSend { event_id: event.id })
                .await
                .map_err(PipelineError::Transient)?;
        } else {
            self.events
                .transition(event.id, EventStatus::Drafted, EventStatus::Approved)
                .await?;
            info!(
                event_id,
                confidence = draft.confidence,
                "draft held for manual approval"
            );
        }
        Ok(())
    }

    /// Sends the drafted reply back to the marketplace; an already-`Sent`
    /// event is a no-op under redelivery.
    async fn auto_send(&self, event_id: i64) -> Result<(), PipelineError> {
        let event = self.load_event(event_id).await?;
        match event.status {
            EventStatus::Sent => {
                info!(event_id, "event already sent, skipping");
                return Ok(());
            }
            EventStatus::Drafted | EventStatus::Approved => {}
            other => {
                warn!(
                    event_id,
                    status = other.as_str(),
                    "event not in a sendable state, skipping"
                );
                return Ok(());
            }
        }

        let reply = event
            .suggested_reply
            .clone()
            .ok_or_else(|| PipelineError::fatal(anyhow!("event {event_id} has no draft reply")))?;
        let cabinet = self
            .cabinets
            .cabinet(event.cabinet_id)
            .await?
            .ok_or_else(|| PipelineError::fatal(StoreError::CabinetNotFound(event.cabinet_id)))?;
        let client = self.registry.client_for(&cabinet);

        let result = match event.event_type {
            EventType::Review => {
                client
                    .send_review_answer(&event.marketplace_event_id, &reply)
                    .await
            }
            EventType::Question => {
                client
                    .send_question_answer(&event.marketplace_event_id, &reply)
                    .await
            }
        }
        .map_err(PipelineError::Transient)?;

        if !result.success {
            self.audit
                .record(
                    Some(event.id),
                    "send_rejected",
                    json!({ "request": result.raw_request, "response": result.raw_response }),
                )
                .await?;
            return Err(PipelineError::Transient(anyhow!(
                "marketplace rejected reply for event {event_id}"
            )));
        }

        if self
            .events
            .transition(event.id, event.status, EventStatus::Sent)
            .await?
        {
            self.audit
                .record(
                    Some(event.id),
                    "reply_sent",
                    json!({
                        "external_id": result.external_id,
                        "request": result.raw_request,
                        "response": result.raw_response,
                    }),
                )
                .await?;
            info!(event_id, "reply sent to marketplace");
        }
        Ok(())
    }

    /// Prunes audit/log rows older than the retention cutoff. The ledger is
    /// never touched here.
    async fn retention_cleanup(&self, retention_days: i64) -> Result<(), PipelineError> {
        if retention_days <= 0 {
            return Err(PipelineError::fatal(anyhow!(
                "retention_days must be positive, got {retention_days}"
            )));
        }
        let cutoff = Utc::now() - Duration::days(retention_days);
        let deleted = self.audit.delete_older_than(cutoff).await?;
        info!(retention_days, %cutoff, deleted, "retention cleanup completed");
        Ok(())
    }

    /// Called by the worker once a task fails terminally: transient
    /// exhaustion parks the event in `Error`; fatal failures (blocked
    /// balance, bad arguments) leave the status untouched. Either way a
    /// failure record lands in the audit trail.
    pub async fn record_failure(&self, task: &Task, err: &PipelineError) {
        let event_id = match task {
            Task::GenerateReply { event_id, .. } | Task::AutoSend { event_id } => Some(*event_id),
            _ => None,
        };

        if let Some(event_id) = event_id {
            if err.is_retryable() {
                match self.events.event(event_id).await {
                    Ok(Some(event)) if event.status.can_transition_to(EventStatus::Error) => {
                        if let Err(store_err) = self
                            .events
                            .transition(event_id, event.status, EventStatus::Error)
                            .await
                        {
                            warn!(event_id, ?store_err, "failed to mark event as errored");
                        }
                    }
                    Ok(_) => {}
                    Err(store_err) => {
                        warn!(event_id, ?store_err, "failed to load event while recording failure");
                    }
                }
            }
        }

        if let Err(audit_err) = self
            .audit
            .record(
                event_id,
                "task_failed",
                json!({ "task": task.name(), "error": err.to_string() }),
            )
            .await
        {
            warn!(task = task.name(), ?audit_err, "failed to record task failure");
        }
    }

    async fn load_event(&self, event_id: i64) -> Result<Event, PipelineError> {
        self.events
            .event(event_id)
            .await?
            .ok_or_else(|| PipelineError::fatal(StoreError::EventNotFound(event_id)))
    }
}

fn sentiment_for(rating: Option<i32>) -> Option<String> {
    rating.map(|value| {
        if value >= 4 {
            "positive".to_string()
        } else {
            "negative".to_string()
        }
    })
}

fn build_prompt(event: &Event) -> String {
    match event.event_type {
        EventType::Review => format!(
            "Customer review (rating {}): {}",
            event
                .rating
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unrated".to_string()),
            event.text
        ),
        EventType::Question => format!("Customer question: {}", event.text),
    }
}
