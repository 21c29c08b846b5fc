use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// key: billing-models -> owner balance, ledger audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplenishmentPolicy {
    /// Events that queued up while the balance was blocked become eligible
    /// again after a top-up.
    ProcessBacklog,
    /// Only events newer than the top-up are processed.
    OnlyNew,
}

impl ReplenishmentPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplenishmentPolicy::ProcessBacklog => "process_backlog",
            ReplenishmentPolicy::OnlyNew => "only_new",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "process_backlog" => Some(ReplenishmentPolicy::ProcessBacklog),
            "only_new" => Some(ReplenishmentPolicy::OnlyNew),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Generation,
    ManualAdjustment,
    TopUp,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::Generation => "generation",
            LedgerReason::ManualAdjustment => "manual_adjustment",
            LedgerReason::TopUp => "top_up",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "generation" => Some(LedgerReason::Generation),
            "manual_adjustment" => Some(LedgerReason::ManualAdjustment),
            "top_up" => Some(LedgerReason::TopUp),
            _ => None,
        }
    }
}

/// key: billing-owner-account -> one billing principal
///
/// Immutable value: every balance transition constructs a new account via
/// `with_balance`/`with_top_up` and persists it through the store, so the
/// billing service stays the single mutation point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerAccount {
    pub owner_id: i64,
    pub balance_tokens: i64,
    pub replenishment_policy: ReplenishmentPolicy,
    pub last_replenished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OwnerAccount {
    pub fn new(owner_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            balance_tokens: 0,
            replenishment_policy: ReplenishmentPolicy::ProcessBacklog,
            last_replenished_at: None,
            updated_at: now,
        }
    }

    /// A blocked owner has events stored but never advanced.
    pub fn is_blocked(&self) -> bool {
        self.balance_tokens <= 0
    }

    pub fn with_balance(&self, balance_tokens: i64, now: DateTime<Utc>) -> Self {
        Self {
            balance_tokens,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn with_top_up(
        &self,
        balance_tokens: i64,
        policy: Option<ReplenishmentPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: self.owner_id,
            balance_tokens,
            replenishment_policy: policy.unwrap_or(self.replenishment_policy),
            last_replenished_at: Some(now),
            updated_at: now,
        }
    }
}

/// key: billing-ledger-entry -> append-only balance change record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub owner_id: i64,
    pub delta: i64,
    pub reason: LedgerReason,
    pub metadata: Value,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        owner_id: i64,
        delta: i64,
        reason: LedgerReason,
        metadata: Option<Value>,
        balance_before: i64,
        balance_after: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            owner_id,
            delta,
            reason,
            metadata: metadata.unwrap_or_else(|| Value::Object(Default::default())),
            balance_before,
            balance_after,
            created_at,
        }
    }
}
