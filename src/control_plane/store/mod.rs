//! # Control Plane Store
//!
//! Durable records for instances, wallets, ledger, usage and deposits.
//!
//! Two rules every implementation upholds:
//!
//! - `apply_balance_change` is the only way a balance moves, and it writes
//!   the matching ledger entry in the same atomic unit. Deposit
//!   confirmation and usage charges both go through it.
//! - `record_usage` inserts the usage record, charges the wallet and
//!   advances `last_billed_at` all-or-nothing, and refuses a window that
//!   does not start at the instance's current `last_billed_at`.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::instance::{Instance, InstanceStatus};
use super::wallet::{BalanceChange, Deposit, LedgerEntry, UsageRecord, Wallet};

/// Store failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Window already billed, or `last_billed_at` moved past its start
    #[error("usage window for instance {instance_id} starting {start_time} already recorded")]
    DuplicateWindow {
        instance_id: Uuid,
        start_time: DateTime<Utc>,
    },

    /// Record not in the state the write expected
    #[error("conflict: {0}")]
    Conflict(String),

    /// Write rejected before touching storage
    #[error("invalid change: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Conditional status change with the fields that change alongside it
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTransition {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub encrypted_password: Option<String>,
    /// Initial billing anchor, set when the instance first runs
    pub billing_start: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl InstanceTransition {
    pub fn new(from: InstanceStatus, to: InstanceStatus) -> Self {
        Self {
            from,
            to,
            encrypted_password: None,
            billing_start: None,
            terminated_at: None,
        }
    }
}

/// One usage window to commit
#[derive(Debug, Clone, PartialEq)]
pub struct UsageCharge {
    pub instance_id: Uuid,
    /// Wallet to debit; `None` records the window without a ledger entry
    pub wallet_id: Option<Uuid>,
    /// Used in the ledger description
    pub db_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub rate_per_hour: Decimal,
    /// Positive charge
    pub amount: Decimal,
}

impl UsageCharge {
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// The usage record this charge writes
    pub fn record(&self) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            instance_id: self.instance_id,
            start_time: self.start,
            end_time: self.end,
            duration_seconds: self.duration_seconds(),
            rate_per_hour: self.rate_per_hour,
            amount: self.amount,
        }
    }

    pub fn balance_change(&self, usage_id: Uuid) -> Option<BalanceChange> {
        self.wallet_id.map(|wallet_id| {
            BalanceChange::usage_charge(wallet_id, self.amount, &self.db_name, usage_id)
        })
    }

    fn validate(&self) -> StoreResult<()> {
        if self.end <= self.start {
            return Err(StoreError::Invalid(format!(
                "usage window ends ({}) before it starts ({})",
                self.end, self.start
            )));
        }
        if self.amount < Decimal::ZERO {
            return Err(StoreError::Invalid("usage amount is negative".to_string()));
        }
        Ok(())
    }
}

/// Committed usage window
#[derive(Debug, Clone, PartialEq)]
pub struct UsageOutcome {
    pub record: UsageRecord,
    /// Wallet after the charge, when one was debited
    pub wallet: Option<Wallet>,
}

/// Held for the duration of a billing pass
#[derive(Debug)]
pub enum BillingLock {
    /// Store has no cross-process lock; in-process exclusion only
    Local,
    /// PostgreSQL session advisory lock
    Advisory(postgres::AdvisoryLock),
}

impl BillingLock {
    pub async fn release(self) {
        if let Self::Advisory(lock) = self {
            lock.release().await;
        }
    }
}

fn check_balance_change(change: &BalanceChange) -> StoreResult<()> {
    if change.entry_type.accepts(change.amount) {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!(
            "{} entry cannot carry amount {}",
            change.entry_type, change.amount
        )))
    }
}

/// Storage for everything the control plane persists
#[async_trait]
pub trait Store: Send + Sync {
    // Wallets & ledger

    /// Wallet for a user, created with a zero balance if absent
    async fn ensure_wallet(&self, user_id: &str) -> StoreResult<Wallet>;

    async fn wallet(&self, wallet_id: Uuid) -> StoreResult<Option<Wallet>>;

    async fn wallet_for_user(&self, user_id: &str) -> StoreResult<Option<Wallet>>;

    /// Move a balance and append the matching ledger entry atomically
    async fn apply_balance_change(
        &self,
        change: BalanceChange,
        now: DateTime<Utc>,
    ) -> StoreResult<(Wallet, LedgerEntry)>;

    /// Newest first
    async fn ledger_entries(&self, wallet_id: Uuid) -> StoreResult<Vec<LedgerEntry>>;

    // Deposits

    async fn insert_deposit(&self, deposit: &Deposit) -> StoreResult<()>;

    /// Newest first
    async fn deposits(&self, user_id: &str) -> StoreResult<Vec<Deposit>>;

    /// Mark a pending deposit confirmed and credit the owner's wallet in one unit.
    /// `Conflict` if the deposit is no longer pending.
    async fn confirm_deposit(
        &self,
        deposit_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<(Deposit, Wallet)>;

    async fn reject_deposit(&self, deposit_id: Uuid, now: DateTime<Utc>) -> StoreResult<Deposit>;

    // Instances

    async fn insert_instance(&self, instance: &Instance) -> StoreResult<()>;

    async fn instance(&self, instance_id: Uuid) -> StoreResult<Option<Instance>>;

    /// Newest first
    async fn instances_for_user(&self, user_id: &str) -> StoreResult<Vec<Instance>>;

    async fn instances_with_status(&self, status: InstanceStatus) -> StoreResult<Vec<Instance>>;

    /// Apply a transition if the instance is still in `transition.from`
    async fn transition_instance(
        &self,
        instance_id: Uuid,
        transition: InstanceTransition,
    ) -> StoreResult<Instance>;

    async fn set_encrypted_password(&self, instance_id: Uuid, ciphertext: &str) -> StoreResult<()>;

    // Usage

    async fn usage_record_exists(
        &self,
        instance_id: Uuid,
        start_time: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Commit a usage window
    async fn record_usage(&self, charge: &UsageCharge) -> StoreResult<UsageOutcome>;

    /// Newest first
    async fn usage_records(&self, instance_id: Uuid) -> StoreResult<Vec<UsageRecord>>;

    // Billing

    /// Cross-process billing lock; `None` when another pass holds it
    async fn try_billing_lock(&self) -> StoreResult<Option<BillingLock>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn charge(seconds: i64) -> UsageCharge {
        let start = Utc::now();
        UsageCharge {
            instance_id: Uuid::new_v4(),
            wallet_id: Some(Uuid::new_v4()),
            db_name: "db_0badf00d".to_string(),
            start,
            end: start + Duration::seconds(seconds),
            rate_per_hour: Decimal::new(75, 1),
            amount: Decimal::new(75, 1),
        }
    }

    #[test]
    fn test_usage_charge_record() {
        let charge = charge(3600);
        let record = charge.record();
        assert_eq!(record.duration_seconds, 3600);
        assert_eq!(record.start_time, charge.start);

        let change = charge.balance_change(record.id).unwrap();
        assert_eq!(change.amount, Decimal::new(-75, 1));
        assert_eq!(change.reference_id, Some(record.id));
    }

    #[test]
    fn test_usage_charge_validation() {
        assert!(charge(60).validate().is_ok());
        assert!(matches!(charge(0).validate(), Err(StoreError::Invalid(_))));

        let mut negative = charge(60);
        negative.amount = Decimal::new(-1, 0);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_zero_rated_window_has_no_balance_change() {
        let mut charge = charge(600);
        charge.wallet_id = None;
        assert!(charge.balance_change(Uuid::new_v4()).is_none());
    }
}
