use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use reviews_backend::billing::{BillingService, ReplenishmentPolicy};
use reviews_backend::db::{EventStore, MemoryStore};
use reviews_backend::events::{Cabinet, EventStatus, EventType, Marketplace};
use reviews_backend::llm::{LlmAdapter, LlmReply};
use reviews_backend::marketplace::{
    ActionResult, ClientRegistry, MarketplaceClient, MarketplaceQuestion, MarketplaceReview,
    RawEvent,
};
use reviews_backend::pipeline::Pipeline;
use reviews_backend::queue::{
    execute_with_policy, QueueClient, QueueName, QueueReceivers, RetryPolicy, Task,
};

#[derive(Default)]
struct FakeClient {
    reviews: Mutex<Vec<MarketplaceReview>>,
    questions: Mutex<Vec<MarketplaceQuestion>>,
    fetch_calls: AtomicUsize,
    last_since: Mutex<Option<Option<DateTime<Utc>>>>,
    reject_sends: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeClient {
    fn push_review(&self, external_id: &str, rating: i32) {
        self.reviews.lock().unwrap().push(MarketplaceReview {
            external_id: external_id.to_string(),
            text: "Great product".to_string(),
            rating: Some(rating),
            created_at: Some(Utc::now()),
            sku: None,
            raw_payload: json!({ "id": external_id }),
        });
    }

    fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn result_for(&self, external_id: &str, text: &str) -> ActionResult {
        let success = !self.reject_sends.load(Ordering::SeqCst);
        if success {
            self.sent
                .lock()
                .unwrap()
                .push((external_id.to_string(), text.to_string()));
        }
        ActionResult {
            success,
            external_id: Some(external_id.to_string()),
            raw_request: json!({ "id": external_id, "text": text }),
            raw_response: json!({ "ok": success }),
        }
    }
}

#[async_trait]
impl MarketplaceClient for FakeClient {
    async fn fetch_reviews(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceReview>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_since.lock().unwrap() = Some(since);
        Ok(self.reviews.lock().unwrap().clone())
    }

    async fn fetch_questions(
        &self,
        _since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceQuestion>> {
        Ok(self.questions.lock().unwrap().clone())
    }

    async fn send_review_answer(
        &self,
        review_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult> {
        Ok(self.result_for(review_id, text))
    }

    async fn send_question_answer(
        &self,
        question_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult> {
        Ok(self.result_for(question_id, text))
    }
}

struct FakeRegistry {
    client: Arc<FakeClient>,
}

impl ClientRegistry for FakeRegistry {
    fn client_for(&self, _cabinet: &Cabinet) -> Arc<dyn MarketplaceClient> {
        self.client.clone()
    }
}

struct FakeLlm {
    reply: Mutex<LlmReply>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeLlm {
    fn confident() -> Self {
        Self::with_reply(90, false)
    }

    fn with_reply(confidence: i32, conflict: bool) -> Self {
        Self {
            reply: Mutex::new(LlmReply {
                text: "Thank you for the feedback!".to_string(),
                confidence,
                kb_rule_ids: vec![11, 12],
                conflict,
            }),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmAdapter for FakeLlm {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<LlmReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("generation service unavailable");
        }
        Ok(self.reply.lock().unwrap().clone())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    billing: BillingService,
    client: Arc<FakeClient>,
    llm: Arc<FakeLlm>,
    pipeline: Pipeline,
    receivers: QueueReceivers,
}

impl Harness {
    fn new(llm: FakeLlm) -> Self {
        let store = Arc::new(MemoryStore::new());
        let billing = BillingService::new(store.clone());
        let client = Arc::new(FakeClient::default());
        let llm = Arc::new(llm);
        let (queue, receivers) = QueueClient::new(16);
        let pipeline = Pipeline::new(
            billing.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(FakeRegistry {
                client: client.clone(),
            }),
            llm.clone(),
            queue,
        );
        Self {
            store,
            billing,
            client,
            llm,
            pipeline,
            receivers,
        }
    }

    async fn add_cabinet(&self, id: i64, owner_id: i64) {
        self.store
            .add_cabinet(Cabinet {
                id,
                project_id: 1,
                owner_id,
                name: format!("shop-{id}"),
                marketplace: Marketplace::Wildberries,
                api_token: "token".to_string(),
            })
            .await;
    }
}

fn raw_review(external_id: &str, rating: i32) -> RawEvent {
    RawEvent {
        marketplace_event_id: external_id.to_string(),
        event_type: EventType::Review,
        text: "Great product".to_string(),
        rating: Some(rating),
        raw_payload: json!({ "id": external_id }),
    }
}

fn drain(receivers: &mut QueueReceivers, queue: QueueName) -> Vec<Task> {
    let mut rx = receivers
        .take(queue)
        .expect("receiver already taken for this queue");
    let mut tasks = Vec::new();
    while let Ok(task) = rx.try_recv() {
        tasks.push(task);
    }
    tasks
}

#[tokio::test]
async fn ingest_is_idempotent_across_redelivery() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;

    let task = Task::IngestEvents {
        cabinet_id: 10,
        payloads: vec![raw_review("r-1", 5), raw_review("r-1", 5), raw_review("r-2", 2)],
    };
    h.pipeline.execute(&task).await.unwrap();
    h.pipeline.execute(&task).await.unwrap();

    // Two distinct events, each queued for generation exactly once.
    let generated = drain(&mut h.receivers, QueueName::Llm);
    assert_eq!(generated.len(), 2);

    let (event, created) = h
        .store
        .insert_or_fetch(reviews_backend::events::NewEvent {
            project_id: 1,
            cabinet_id: 10,
            marketplace_event_id: "r-1".to_string(),
            marketplace: Marketplace::Wildberries,
            event_type: EventType::Review,
            text: "Great product".to_string(),
            rating: Some(5),
            sentiment: None,
            raw_payload: json!({}),
        })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(event.sentiment.as_deref(), Some("positive"));
}

#[tokio::test]
async fn confident_draft_is_queued_for_autosend_and_debited_once() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 5)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);
    h.pipeline.execute(&generate).await.unwrap();

    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Drafted);
    assert_eq!(event.confidence, Some(90));
    assert_eq!(event.kb_rule_ids, vec![11, 12]);
    assert_eq!(h.billing.account(1).await.unwrap().balance_tokens, 4);
    assert_eq!(drain(&mut h.receivers, QueueName::Autosend).len(), 1);

    // Redelivery of the same task must not debit or enqueue again.
    h.pipeline.execute(&generate).await.unwrap();
    assert_eq!(h.billing.account(1).await.unwrap().balance_tokens, 4);
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn low_confidence_draft_is_held_for_approval() {
    let mut h = Harness::new(FakeLlm::with_reply(30, false));
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 4)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);
    h.pipeline.execute(&generate).await.unwrap();

    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Approved);
    assert!(drain(&mut h.receivers, QueueName::Autosend).is_empty());
}

#[tokio::test]
async fn knowledge_conflict_escalates_even_at_full_confidence() {
    let mut h = Harness::new(FakeLlm::with_reply(100, true));
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 1)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);
    h.pipeline.execute(&generate).await.unwrap();

    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Escalated);
    assert!(event.conflict);
    assert!(drain(&mut h.receivers, QueueName::Autosend).is_empty());
}

#[tokio::test]
async fn blocked_owner_fails_generation_fatally_without_llm_cost() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 5)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);

    let err = h.pipeline.execute(&generate).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);

    // The event stays durably stored in `new`, waiting for a top-up.
    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::New);
}

#[tokio::test]
async fn blocked_owner_is_skipped_during_polling() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.client.push_review("r-1", 5);

    h.pipeline.execute(&Task::PollMarketplaces).await.unwrap();

    assert_eq!(h.client.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(drain(&mut h.receivers, QueueName::Ingest).is_empty());
}

#[tokio::test]
async fn only_new_policy_windows_polling_from_the_top_up() {
    let h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    let account = h
        .billing
        .top_up(1, 5, Some(ReplenishmentPolicy::OnlyNew), None)
        .await
        .unwrap();

    h.pipeline.execute(&Task::PollMarketplaces).await.unwrap();

    let since = h.client.last_since.lock().unwrap().unwrap();
    assert_eq!(since, account.last_replenished_at);
}

#[tokio::test]
async fn process_backlog_readmits_stored_new_events_after_top_up() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 1, None, None).await.unwrap();
    h.client.push_review("r-1", 5);
    h.client.push_review("r-2", 5);

    let mut ingest_rx = h.receivers.take(QueueName::Ingest).unwrap();
    let mut llm_rx = h.receivers.take(QueueName::Llm).unwrap();

    h.pipeline.execute(&Task::PollMarketplaces).await.unwrap();
    let ingest = ingest_rx.try_recv().unwrap();
    h.pipeline.execute(&ingest).await.unwrap();

    // The first generation drains the only token; the second hits the block
    // and its event stays stored in `new`.
    let first = llm_rx.try_recv().unwrap();
    let second = llm_rx.try_recv().unwrap();
    h.pipeline.execute(&first).await.unwrap();
    let err = h.pipeline.execute(&second).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(
        h.store.event(2).await.unwrap().unwrap().status,
        EventStatus::New
    );

    h.billing.top_up(1, 10, None, None).await.unwrap();

    // The next poll cycle re-fetches the same items; under the backlog
    // policy the stored event must be re-admitted to generation.
    h.pipeline.execute(&Task::PollMarketplaces).await.unwrap();
    let ingest = ingest_rx.try_recv().unwrap();
    h.pipeline.execute(&ingest).await.unwrap();

    let readmitted = llm_rx.try_recv().unwrap();
    match &readmitted {
        Task::GenerateReply { event_id, owner_id } => {
            assert_eq!(*event_id, 2);
            assert_eq!(*owner_id, 1);
        }
        other => panic!("expected a generation task, got {other:?}"),
    }
    // The already-drafted event is not queued again.
    assert!(llm_rx.try_recv().is_err());

    h.pipeline.execute(&readmitted).await.unwrap();
    assert_eq!(
        h.store.event(2).await.unwrap().unwrap().status,
        EventStatus::Drafted
    );
}

#[tokio::test]
async fn backlog_policy_polls_without_a_window() {
    let h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline.execute(&Task::PollMarketplaces).await.unwrap();

    let since = h.client.last_since.lock().unwrap().unwrap();
    assert_eq!(since, None);
}

#[tokio::test]
async fn autosend_sends_once_and_skips_redelivery() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 5)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);
    h.pipeline.execute(&generate).await.unwrap();
    let send = drain(&mut h.receivers, QueueName::Autosend).remove(0);

    h.pipeline.execute(&send).await.unwrap();
    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Sent);
    assert_eq!(h.client.sent_ids(), vec!["r-1".to_string()]);
    let kinds: Vec<String> = h
        .store
        .audit_for_event(1)
        .await
        .into_iter()
        .map(|(kind, _)| kind)
        .collect();
    assert_eq!(kinds, vec!["reply_sent".to_string()]);

    // Redelivered send is a no-op.
    h.pipeline.execute(&send).await.unwrap();
    assert_eq!(h.client.sent_ids().len(), 1);
    assert_eq!(h.store.audit_for_event(1).await.len(), 1);
}

#[tokio::test]
async fn marketplace_rejection_is_transient_and_audited() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 5)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);
    h.pipeline.execute(&generate).await.unwrap();
    let send = drain(&mut h.receivers, QueueName::Autosend).remove(0);

    h.client.reject_sends.store(true, Ordering::SeqCst);
    let err = h.pipeline.execute(&send).await.unwrap_err();
    assert!(err.is_retryable());

    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Drafted);
    let kinds: Vec<String> = h
        .store
        .audit_for_event(1)
        .await
        .into_iter()
        .map(|(kind, _)| kind)
        .collect();
    assert_eq!(kinds, vec!["send_rejected".to_string()]);

    // The retried delivery succeeds once the marketplace recovers.
    h.client.reject_sends.store(false, Ordering::SeqCst);
    h.pipeline.execute(&send).await.unwrap();
    assert_eq!(
        h.store.event(1).await.unwrap().unwrap().status,
        EventStatus::Sent
    );
}

#[tokio::test]
async fn exhausted_retries_park_the_event_in_error() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();

    h.pipeline
        .execute(&Task::IngestEvents {
            cabinet_id: 10,
            payloads: vec![raw_review("r-1", 5)],
        })
        .await
        .unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);

    h.llm.fail.store(true, Ordering::SeqCst);
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        jitter: false,
    };
    let err = execute_with_policy(&h.pipeline, generate, policy)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);

    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Error);
    let kinds: Vec<String> = h
        .store
        .audit_for_event(1)
        .await
        .into_iter()
        .map(|(kind, _)| kind)
        .collect();
    assert_eq!(kinds, vec!["task_failed".to_string()]);
    // No debit happened for the failed generation.
    assert_eq!(h.billing.account(1).await.unwrap().balance_tokens, 5);
}

#[tokio::test]
async fn full_review_flow_from_poll_to_sent() {
    let mut h = Harness::new(FakeLlm::confident());
    h.add_cabinet(10, 1).await;
    h.billing.top_up(1, 5, None, None).await.unwrap();
    h.client.push_review("r-77", 5);

    h.pipeline.execute(&Task::PollMarketplaces).await.unwrap();
    let ingest = drain(&mut h.receivers, QueueName::Ingest).remove(0);
    h.pipeline.execute(&ingest).await.unwrap();
    let generate = drain(&mut h.receivers, QueueName::Llm).remove(0);
    h.pipeline.execute(&generate).await.unwrap();
    let send = drain(&mut h.receivers, QueueName::Autosend).remove(0);
    h.pipeline.execute(&send).await.unwrap();

    let event = h.store.event(1).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Sent);
    assert_eq!(event.marketplace_event_id, "r-77");
    assert_eq!(h.billing.account(1).await.unwrap().balance_tokens, 4);
    assert_eq!(h.client.sent_ids(), vec!["r-77".to_string()]);
}

#[tokio::test]
async fn retention_prunes_only_rows_past_the_cutoff() {
    let h = Harness::new(FakeLlm::confident());
    let now = Utc::now();
    h.store
        .seed_audit_record(Some(1), "reply_sent", now - chrono::Duration::days(120))
        .await;
    h.store
        .seed_audit_record(Some(2), "reply_sent", now - chrono::Duration::days(5))
        .await;

    h.pipeline
        .execute(&Task::RetentionCleanup { retention_days: 90 })
        .await
        .unwrap();

    assert_eq!(h.store.audit_len().await, 1);
    assert_eq!(h.store.audit_kinds().await, vec!["reply_sent".to_string()]);
}

#[tokio::test]
async fn retention_rejects_a_non_positive_window() {
    let h = Harness::new(FakeLlm::confident());
    let err = h
        .pipeline
        .execute(&Task::RetentionCleanup { retention_days: 0 })
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
}
