pub mod models;
pub mod service;

pub use models::{LedgerEntry, LedgerReason, OwnerAccount, ReplenishmentPolicy};
pub use service::{BillingError, BillingService};
