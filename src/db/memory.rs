use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::billing::models::{LedgerEntry, OwnerAccount};
use crate::events::{Cabinet, Event, EventStatus, NewEvent, ReplyDraft};

use super::{AuditStore, BillingStore, CabinetStore, EventStore, StoreError};

#[derive(Debug, Clone)]
struct AuditRow {
    event_id: Option<i64>,
    kind: String,
    detail: Value,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<i64, OwnerAccount>,
    ledger: Vec<LedgerEntry>,
    events: HashMap<i64, Event>,
    events_by_key: HashMap<(i64, String), i64>,
    next_event_id: i64,
    cabinets: Vec<Cabinet>,
    audit: Vec<AuditRow>,
}

/// In-memory store mirroring the Postgres semantics: one mutex plays the
/// role of the row transaction, so balance commits and upserts are atomic
/// with respect to each other.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cabinet(&self, cabinet: Cabinet) {
        let mut inner = self.inner.lock().await;
        inner.cabinets.push(cabinet);
    }

    pub async fn audit_kinds(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.audit.iter().map(|row| row.kind.clone()).collect()
    }

    pub async fn audit_len(&self) -> usize {
        self.inner.lock().await.audit.len()
    }

    pub async fn audit_for_event(&self, event_id: i64) -> Vec<(String, Value)> {
        let inner = self.inner.lock().await;
        inner
            .audit
            .iter()
            .filter(|row| row.event_id == Some(event_id))
            .map(|row| (row.kind.clone(), row.detail.clone()))
            .collect()
    }

    pub async fn seed_audit_record(
        &self,
        event_id: Option<i64>,
        kind: &str,
        created_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.audit.push(AuditRow {
            event_id,
            kind: kind.to_string(),
            detail: Value::Object(Default::default()),
            created_at,
        });
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn load_or_create_account(&self, owner_id: i64) -> Result<OwnerAccount, StoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .entry(owner_id)
            .or_insert_with(|| OwnerAccount::new(owner_id, Utc::now()));
        Ok(account.clone())
    }

    async fn commit_balance_change(
        &self,
        account: &OwnerAccount,
        entry: &LedgerEntry,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .accounts
            .get(&account.owner_id)
            .cloned()
            .unwrap_or_else(|| OwnerAccount::new(account.owner_id, account.updated_at));
        if stored.balance_tokens != entry.balance_before {
            return Err(StoreError::BalanceConflict(account.owner_id));
        }
        inner.accounts.insert(account.owner_id, account.clone());
        inner.ledger.push(entry.clone());
        Ok(())
    }

    async fn ledger_for_owner(&self, owner_id: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_or_fetch(&self, event: NewEvent) -> Result<(Event, bool), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (event.cabinet_id, event.marketplace_event_id.clone());
        if let Some(existing_id) = inner.events_by_key.get(&key) {
            let existing = inner.events[existing_id].clone();
            return Ok((existing, false));
        }

        inner.next_event_id += 1;
        let id = inner.next_event_id;
        let now = Utc::now();
        let row = Event {
            id,
            project_id: event.project_id,
            cabinet_id: event.cabinet_id,
            marketplace_event_id: event.marketplace_event_id,
            marketplace: event.marketplace,
            event_type: event.event_type,
            text: event.text,
            rating: event.rating,
            sentiment: event.sentiment,
            status: EventStatus::New,
            suggested_reply: None,
            confidence: None,
            kb_rule_ids: Vec::new(),
            conflict: false,
            raw_payload: event.raw_payload,
            created_at: now,
            updated_at: now,
        };
        inner.events_by_key.insert(key, id);
        inner.events.insert(id, row.clone());
        Ok((row, true))
    }

    async fn event(&self, event_id: i64) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(&event_id).cloned())
    }

    async fn store_draft(&self, event_id: i64, draft: &ReplyDraft) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .events
            .get_mut(&event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;
        if event.status != EventStatus::New {
            return Ok(false);
        }
        event.suggested_reply = Some(draft.suggested_reply.clone());
        event.confidence = Some(draft.confidence);
        event.kb_rule_ids = draft.kb_rule_ids.clone();
        event.conflict = draft.conflict;
        event.status = EventStatus::Drafted;
        event.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition(
        &self,
        event_id: i64,
        from: EventStatus,
        to: EventStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .events
            .get_mut(&event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;
        if event.status != from {
            return Ok(false);
        }
        event.status = to;
        event.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl CabinetStore for MemoryStore {
    async fn list_cabinets(&self) -> Result<Vec<Cabinet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.cabinets.clone())
    }

    async fn cabinet(&self, cabinet_id: i64) -> Result<Option<Cabinet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cabinets
            .iter()
            .find(|cabinet| cabinet.id == cabinet_id)
            .cloned())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn record(
        &self,
        event_id: Option<i64>,
        kind: &str,
        detail: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.audit.push(AuditRow {
            event_id,
            kind: kind.to_string(),
            detail,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.audit.len();
        inner.audit.retain(|row| row.created_at >= cutoff);
        Ok((before - inner.audit.len()) as u64)
    }
}
