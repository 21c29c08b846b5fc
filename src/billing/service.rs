use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::db::{BillingStore, StoreError};

use super::models::{LedgerEntry, LedgerReason, OwnerAccount, ReplenishmentPolicy};

/// Attempts against a stale balance snapshot before giving up; each retry
/// reloads the account and re-applies the preconditions.
const BALANCE_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Programmer error; never retried.
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("owner {owner_id} balance is zero, operations blocked")]
    BalanceBlocked { owner_id: i64 },
    #[error(
        "owner {owner_id} has insufficient balance: requested={requested}, available={available}"
    )]
    InsufficientBalance {
        owner_id: i64,
        requested: i64,
        available: i64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// key: billing-service -> token balance lifecycle
///
/// The single mutation point for owner balances: every transition goes
/// through `debit_tokens`/`top_up`, which pair the balance change with an
/// appended ledger entry in one store transaction.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
}

impl BillingService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Current account for the owner, created with a zero balance on first
    /// lookup.
    pub async fn account(&self, owner_id: i64) -> Result<OwnerAccount, BillingError> {
        Ok(self.store.load_or_create_account(owner_id).await?)
    }

    pub async fn debit_tokens(
        &self,
        owner_id: i64,
        amount: i64,
        reason: LedgerReason,
        metadata: Option<Value>,
    ) -> Result<OwnerAccount, BillingError> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let owner = self.store.load_or_create_account(owner_id).await?;
            if owner.balance_tokens <= 0 {
                return Err(BillingError::BalanceBlocked { owner_id });
            }
            if owner.balance_tokens < amount {
                return Err(BillingError::InsufficientBalance {
                    owner_id,
                    requested: amount,
                    available: owner.balance_tokens,
                });
            }

            let now = Utc::now();
            let updated = owner.with_balance(owner.balance_tokens - amount, now);
            let entry = LedgerEntry::new(
                owner_id,
                -amount,
                reason,
                metadata.clone(),
                owner.balance_tokens,
                updated.balance_tokens,
                now,
            );
            match self.store.commit_balance_change(&updated, &entry).await {
                Ok(()) => {
                    info!(
                        owner_id,
                        amount,
                        reason = reason.as_str(),
                        balance = updated.balance_tokens,
                        "debited owner balance"
                    );
                    return Ok(updated);
                }
                Err(StoreError::BalanceConflict(_)) if attempt < BALANCE_COMMIT_ATTEMPTS => {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn top_up(
        &self,
        owner_id: i64,
        amount: i64,
        policy: Option<ReplenishmentPolicy>,
        metadata: Option<Value>,
    ) -> Result<OwnerAccount, BillingError> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let owner = self.store.load_or_create_account(owner_id).await?;
            let now = Utc::now();
            let updated = owner.with_top_up(owner.balance_tokens + amount, policy, now);
            let entry = LedgerEntry::new(
                owner_id,
                amount,
                LedgerReason::TopUp,
                metadata.clone(),
                owner.balance_tokens,
                updated.balance_tokens,
                now,
            );
            match self.store.commit_balance_change(&updated, &entry).await {
                Ok(()) => {
                    info!(
                        owner_id,
                        amount,
                        balance = updated.balance_tokens,
                        policy = updated.replenishment_policy.as_str(),
                        "topped up owner balance"
                    );
                    return Ok(updated);
                }
                Err(StoreError::BalanceConflict(_)) if attempt < BALANCE_COMMIT_ATTEMPTS => {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Full ledger for one owner, oldest first; used by reconciliation and
    /// the balance audit surfaces.
    pub async fn ledger(&self, owner_id: i64) -> Result<Vec<LedgerEntry>, BillingError> {
        Ok(self.store.ledger_for_owner(owner_id).await?)
    }
}
