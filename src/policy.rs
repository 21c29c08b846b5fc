//! Pure admission-control guardrails consulted at pipeline checkpoints.
//! No side effects here: each function inspects an account snapshot (or a
//! draft's scores) and either passes or names the reason processing stops.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::billing::models::{OwnerAccount, ReplenishmentPolicy};
use crate::billing::BillingError;
use crate::config;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("owner {owner_id} balance is zero, event processing blocked")]
    EventProcessingBlocked { owner_id: i64 },
}

/// Eligibility window for events after a top-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start_time: Option<DateTime<Utc>>,
    pub include_backlog: bool,
}

impl EventWindow {
    /// Whether an event that arrived at the given time is eligible under
    /// this window.
    pub fn admits(&self, arrived_at: DateTime<Utc>) -> bool {
        self.include_backlog || self.start_time.map_or(true, |start| arrived_at >= start)
    }
}

/// Checkpoint before an event is admitted into the active processing set.
/// A blocked owner still gets events durably stored, just not advanced.
pub fn guard_parsing(owner: &OwnerAccount) -> Result<(), PolicyError> {
    if owner.is_blocked() {
        return Err(PolicyError::EventProcessingBlocked {
            owner_id: owner.owner_id,
        });
    }
    Ok(())
}

/// Checkpoint immediately before a generation debit is attempted. Tests the
/// same condition as `guard_parsing` but reports the billing error kind, as
/// the debit path does; cheap early exit before any LLM cost is incurred.
pub fn guard_generation(owner: &OwnerAccount) -> Result<(), BillingError> {
    if owner.is_blocked() {
        return Err(BillingError::BalanceBlocked {
            owner_id: owner.owner_id,
        });
    }
    Ok(())
}

/// Which events become eligible once an owner replenishes. `ProcessBacklog`
/// reopens everything; `OnlyNew` admits only events newer than the top-up,
/// leaving older ones permanently skipped for this cycle.
pub fn window_after_replenishment(owner: &OwnerAccount) -> EventWindow {
    match owner.replenishment_policy {
        ReplenishmentPolicy::ProcessBacklog => EventWindow {
            start_time: None,
            include_backlog: true,
        },
        ReplenishmentPolicy::OnlyNew => EventWindow {
            start_time: owner.last_replenished_at,
            include_backlog: false,
        },
    }
}

/// Sole authority for draft-to-autosend promotion. A knowledge conflict
/// always forces manual review, regardless of confidence.
pub fn should_autosend(confidence: i32, has_conflict: bool, min_confidence: i32) -> bool {
    if has_conflict {
        return false;
    }
    confidence >= min_confidence
}

/// `should_autosend` with the configured threshold.
pub fn should_autosend_default(confidence: i32, has_conflict: bool) -> bool {
    should_autosend(confidence, has_conflict, *config::AUTOSEND_MIN_CONFIDENCE)
}
