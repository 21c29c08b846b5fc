pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::billing::models::{LedgerEntry, OwnerAccount};
use crate::events::{Cabinet, Event, EventStatus, NewEvent, ReplyDraft};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("event {0} not found")]
    EventNotFound(i64),
    #[error("cabinet {0} not found")]
    CabinetNotFound(i64),
    #[error("concurrent balance update for owner {0}")]
    BalanceConflict(i64),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Storage seam for owner balances and the append-only ledger.
///
/// `commit_balance_change` persists the updated account and the entry as one
/// logical transaction: either both land or neither does. Implementations
/// must reject a commit whose `balance_before` no longer matches the stored
/// balance with `StoreError::BalanceConflict` so concurrent debits for one
/// owner serialize instead of double-spending.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Fetches the account, creating it with a zero balance on first lookup.
    async fn load_or_create_account(&self, owner_id: i64) -> Result<OwnerAccount, StoreError>;

    async fn commit_balance_change(
        &self,
        account: &OwnerAccount,
        entry: &LedgerEntry,
    ) -> Result<(), StoreError>;

    async fn ledger_for_owner(&self, owner_id: i64) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// Storage seam for inbound events and their status machine.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent upsert keyed by `(cabinet_id, marketplace_event_id)`.
    /// Returns the persisted row plus whether this call created it; a race
    /// between two ingesters resolves via the uniqueness constraint, with
    /// the loser returning the winner's row.
    async fn insert_or_fetch(&self, event: NewEvent) -> Result<(Event, bool), StoreError>;

    async fn event(&self, event_id: i64) -> Result<Option<Event>, StoreError>;

    /// Writes draft fields and moves `New -> Drafted` in one guarded update.
    /// Returns false when the event already advanced past `New`.
    async fn store_draft(&self, event_id: i64, draft: &ReplyDraft) -> Result<bool, StoreError>;

    /// Guarded status transition; returns false when the persisted status
    /// is no longer `from`.
    async fn transition(
        &self,
        event_id: i64,
        from: EventStatus,
        to: EventStatus,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CabinetStore: Send + Sync {
    async fn list_cabinets(&self) -> Result<Vec<Cabinet>, StoreError>;
    async fn cabinet(&self, cabinet_id: i64) -> Result<Option<Cabinet>, StoreError>;
}

/// Append-only operational audit trail; the only table the retention task
/// is allowed to prune.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, event_id: Option<i64>, kind: &str, detail: Value)
        -> Result<(), StoreError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
