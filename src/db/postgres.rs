use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::billing::models::{LedgerEntry, LedgerReason, OwnerAccount, ReplenishmentPolicy};
use crate::events::{Cabinet, Event, EventStatus, EventType, Marketplace, NewEvent, ReplyDraft};

use super::{AuditStore, BillingStore, CabinetStore, EventStore, StoreError};

/// Postgres-backed store. Balance commits run as a single transaction with
/// an optimistic guard on the previous balance; event upserts lean on the
/// `(cabinet_id, marketplace_event_id)` unique constraint.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn load_or_create_account(&self, owner_id: i64) -> Result<OwnerAccount, StoreError> {
        sqlx::query(
            "INSERT INTO owner_accounts (owner_id, balance_tokens, replenishment_policy) \
             VALUES ($1, 0, 'process_backlog') ON CONFLICT (owner_id) DO NOTHING",
        )
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT owner_id, balance_tokens, replenishment_policy, last_replenished_at, updated_at \
             FROM owner_accounts WHERE owner_id = $1",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        map_account(&row)
    }

    async fn commit_balance_change(
        &self,
        account: &OwnerAccount,
        entry: &LedgerEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE owner_accounts SET \
                 balance_tokens = $2, \
                 replenishment_policy = $3, \
                 last_replenished_at = $4, \
                 updated_at = $5 \
             WHERE owner_id = $1 AND balance_tokens = $6",
        )
        .bind(account.owner_id)
        .bind(account.balance_tokens)
        .bind(account.replenishment_policy.as_str())
        .bind(account.last_replenished_at)
        .bind(account.updated_at)
        .bind(entry.balance_before)
        .execute(&mut tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::BalanceConflict(account.owner_id));
        }

        sqlx::query(
            "INSERT INTO ledger_entries \
                 (entry_id, owner_id, delta, reason, metadata, balance_before, balance_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.entry_id)
        .bind(entry.owner_id)
        .bind(entry.delta)
        .bind(entry.reason.as_str())
        .bind(&entry.metadata)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.created_at)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn ledger_for_owner(&self, owner_id: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT entry_id, owner_id, delta, reason, metadata, balance_before, balance_after, created_at \
             FROM ledger_entries WHERE owner_id = $1 ORDER BY created_at, entry_id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_ledger_entry).collect()
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_or_fetch(&self, event: NewEvent) -> Result<(Event, bool), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO events \
                 (project_id, cabinet_id, marketplace_event_id, marketplace, event_type, \
                  text, rating, sentiment, status, raw_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'new', $9) \
             ON CONFLICT (cabinet_id, marketplace_event_id) DO NOTHING \
             RETURNING *",
        )
        .bind(event.project_id)
        .bind(event.cabinet_id)
        .bind(&event.marketplace_event_id)
        .bind(event.marketplace.as_str())
        .bind(event.event_type.as_str())
        .bind(&event.text)
        .bind(event.rating)
        .bind(&event.sentiment)
        .bind(&event.raw_payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((map_event(&row)?, true));
        }

        // Lost the uniqueness race (or a re-delivery): hand back the winner.
        let row = sqlx::query(
            "SELECT * FROM events WHERE cabinet_id = $1 AND marketplace_event_id = $2",
        )
        .bind(event.cabinet_id)
        .bind(&event.marketplace_event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((map_event(&row)?, false))
    }

    async fn event(&self, event_id: i64) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_event).transpose()
    }

    async fn store_draft(&self, event_id: i64, draft: &ReplyDraft) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET \
                 suggested_reply = $2, \
                 confidence = $3, \
                 kb_rule_ids = $4, \
                 conflict = $5, \
                 status = 'drafted', \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'new'",
        )
        .bind(event_id)
        .bind(&draft.suggested_reply)
        .bind(draft.confidence)
        .bind(&draft.kb_rule_ids)
        .bind(draft.conflict)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        event_id: i64,
        from: EventStatus,
        to: EventStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(event_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CabinetStore for PgStore {
    async fn list_cabinets(&self) -> Result<Vec<Cabinet>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, owner_id, name, marketplace, api_token FROM cabinets ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_cabinet).collect()
    }

    async fn cabinet(&self, cabinet_id: i64) -> Result<Option<Cabinet>, StoreError> {
        let row = sqlx::query(
            "SELECT id, project_id, owner_id, name, marketplace, api_token FROM cabinets WHERE id = $1",
        )
        .bind(cabinet_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_cabinet).transpose()
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn record(
        &self,
        event_id: Option<i64>,
        kind: &str,
        detail: Value,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO audit_log (event_id, kind, detail) VALUES ($1, $2, $3)")
            .bind(event_id)
            .bind(kind)
            .bind(detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn map_account(row: &PgRow) -> Result<OwnerAccount, StoreError> {
    let policy: String = row.get("replenishment_policy");
    Ok(OwnerAccount {
        owner_id: row.get("owner_id"),
        balance_tokens: row.get("balance_tokens"),
        replenishment_policy: ReplenishmentPolicy::from_str(&policy)
            .ok_or_else(|| StoreError::CorruptRow(format!("replenishment_policy {policy}")))?,
        last_replenished_at: row.get("last_replenished_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_ledger_entry(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let reason: String = row.get("reason");
    Ok(LedgerEntry {
        entry_id: row.get("entry_id"),
        owner_id: row.get("owner_id"),
        delta: row.get("delta"),
        reason: LedgerReason::from_str(&reason)
            .ok_or_else(|| StoreError::CorruptRow(format!("ledger reason {reason}")))?,
        metadata: row.get("metadata"),
        balance_before: row.get("balance_before"),
        balance_after: row.get("balance_after"),
        created_at: row.get("created_at"),
    })
}

fn map_event(row: &PgRow) -> Result<Event, StoreError> {
    let marketplace: String = row.get("marketplace");
    let event_type: String = row.get("event_type");
    let status: String = row.get("status");
    Ok(Event {
        id: row.get("id"),
        project_id: row.get("project_id"),
        cabinet_id: row.get("cabinet_id"),
        marketplace_event_id: row.get("marketplace_event_id"),
        marketplace: Marketplace::from_str(&marketplace)
            .ok_or_else(|| StoreError::CorruptRow(format!("marketplace {marketplace}")))?,
        event_type: EventType::from_str(&event_type)
            .ok_or_else(|| StoreError::CorruptRow(format!("event_type {event_type}")))?,
        text: row.get("text"),
        rating: row.get("rating"),
        sentiment: row.get("sentiment"),
        status: EventStatus::from_str(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("status {status}")))?,
        suggested_reply: row.get("suggested_reply"),
        confidence: row.get("confidence"),
        kb_rule_ids: row.get("kb_rule_ids"),
        conflict: row.get("conflict"),
        raw_payload: row.get("raw_payload"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_cabinet(row: &PgRow) -> Result<Cabinet, StoreError> {
    let marketplace: String = row.get("marketplace");
    Ok(Cabinet {
        id: row.get("id"),
        project_id: row.get("project_id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        marketplace: Marketplace::from_str(&marketplace)
            .ok_or_else(|| StoreError::CorruptRow(format!("marketplace {marketplace}")))?,
        api_token: row.get("api_token"),
    })
}
