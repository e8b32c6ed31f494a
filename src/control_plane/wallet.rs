//! # Wallet & Ledger
//!
//! Prepaid wallets, their append-only ledger and the usage records the
//! billing engine produces. Every balance change goes through
//! [`Store::apply_balance_change`](super::store::Store::apply_balance_change)
//! and is paired with exactly one ledger entry, so
//! `sum(ledger) == balance` for every wallet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::errors::{ControlPlaneError, ControlPlaneResult};
use super::store::Store;

/// One wallet per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: String,
    /// May be negative right after a charge that triggers suspension
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    /// Confirmed deposit, positive
    Deposit,
    /// Billing window charge, zero or negative
    UsageCharge,
    /// Credit back to the user, positive
    Refund,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::UsageCharge => "usage_charge",
            Self::Refund => "refund",
        }
    }

    /// Sign convention: deposits and refunds credit, charges debit
    pub fn accepts(&self, amount: Decimal) -> bool {
        match self {
            Self::Deposit | Self::Refund => amount > Decimal::ZERO,
            Self::UsageCharge => amount <= Decimal::ZERO,
        }
    }
}

impl std::fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerEntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "usage_charge" => Ok(Self::UsageCharge),
            "refund" => Ok(Self::Refund),
            other => Err(format!("unknown ledger entry type '{}'", other)),
        }
    }
}

/// Immutable accounting record explaining one balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    /// Signed; equals the balance delta
    pub amount: Decimal,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A balance mutation and the ledger entry that explains it
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub wallet_id: Uuid,
    pub entry_type: LedgerEntryType,
    pub amount: Decimal,
    pub description: String,
    pub reference_id: Option<Uuid>,
}

impl BalanceChange {
    /// Credit for a confirmed deposit
    pub fn deposit(wallet_id: Uuid, amount: Decimal, deposit_id: Uuid) -> Self {
        Self {
            wallet_id,
            entry_type: LedgerEntryType::Deposit,
            amount,
            description: "Deposit confirmed".to_string(),
            reference_id: Some(deposit_id),
        }
    }

    /// Debit for a billing window; `amount` is the positive charge
    pub fn usage_charge(wallet_id: Uuid, amount: Decimal, db_name: &str, usage_id: Uuid) -> Self {
        Self {
            wallet_id,
            entry_type: LedgerEntryType::UsageCharge,
            amount: -amount,
            description: format!("Usage charge for {}", db_name),
            reference_id: Some(usage_id),
        }
    }

    pub fn refund(
        wallet_id: Uuid,
        amount: Decimal,
        description: impl Into<String>,
        reference_id: Option<Uuid>,
    ) -> Self {
        Self {
            wallet_id,
            entry_type: LedgerEntryType::Refund,
            amount,
            description: description.into(),
            reference_id,
        }
    }

    /// Ledger entry recording this change
    pub fn entry(&self, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            wallet_id: self.wallet_id,
            entry_type: self.entry_type,
            amount: self.amount,
            description: self.description.clone(),
            reference_id: self.reference_id,
            created_at,
        }
    }
}

/// One billed (or zero-rated) window of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub rate_per_hour: Decimal,
    pub amount: Decimal,
}

/// Deposit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown deposit status '{}'", other)),
        }
    }
}

/// User top-up awaiting confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub id: Uuid,
    pub user_id: String,
    pub amount: Decimal,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Wallet operations outside of billing
#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn Store>,
}

impl WalletService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Wallet for a user, created with a zero balance if absent
    pub async fn ensure_wallet(&self, user_id: &str) -> ControlPlaneResult<Wallet> {
        Ok(self.store.ensure_wallet(user_id).await?)
    }

    pub async fn wallet_for_user(&self, user_id: &str) -> ControlPlaneResult<Wallet> {
        self.store
            .wallet_for_user(user_id)
            .await?
            .ok_or_else(|| ControlPlaneError::WalletNotFound {
                id: user_id.to_string(),
            })
    }

    /// Record a pending deposit
    pub async fn create_deposit(&self, user_id: &str, amount: Decimal) -> ControlPlaneResult<Deposit> {
        if amount <= Decimal::ZERO {
            return Err(ControlPlaneError::InvalidAmount {
                amount,
                reason: "deposit amount must be positive".to_string(),
            });
        }

        let deposit = Deposit {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            amount,
            status: DepositStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.store.insert_deposit(&deposit).await?;

        info!(deposit_id = %deposit.id, user_id, %amount, "deposit created");
        Ok(deposit)
    }

    /// Confirm a pending deposit and credit the wallet in one unit
    pub async fn confirm_deposit(&self, deposit_id: Uuid) -> ControlPlaneResult<(Deposit, Wallet)> {
        let (deposit, wallet) = self
            .store
            .confirm_deposit(deposit_id, Utc::now())
            .await
            .map_err(|e| ControlPlaneError::from_deposit(deposit_id, e))?;

        info!(
            deposit_id = %deposit.id,
            wallet_id = %wallet.id,
            amount = %deposit.amount,
            balance = %wallet.balance,
            "deposit confirmed"
        );
        Ok((deposit, wallet))
    }

    /// Reject a pending deposit; no balance change
    pub async fn reject_deposit(&self, deposit_id: Uuid) -> ControlPlaneResult<Deposit> {
        let deposit = self
            .store
            .reject_deposit(deposit_id, Utc::now())
            .await
            .map_err(|e| ControlPlaneError::from_deposit(deposit_id, e))?;

        info!(deposit_id = %deposit.id, "deposit rejected");
        Ok(deposit)
    }

    pub async fn deposits(&self, user_id: &str) -> ControlPlaneResult<Vec<Deposit>> {
        Ok(self.store.deposits(user_id).await?)
    }

    /// Credit a wallet
    pub async fn refund(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        description: &str,
        reference_id: Option<Uuid>,
    ) -> ControlPlaneResult<(Wallet, LedgerEntry)> {
        if amount <= Decimal::ZERO {
            return Err(ControlPlaneError::InvalidAmount {
                amount,
                reason: "refund amount must be positive".to_string(),
            });
        }

        let change = BalanceChange::refund(wallet_id, amount, description, reference_id);
        let (wallet, entry) = self.store.apply_balance_change(change, Utc::now()).await?;

        info!(wallet_id = %wallet.id, %amount, balance = %wallet.balance, "refund posted");
        Ok((wallet, entry))
    }

    /// Ledger entries, newest first
    pub async fn ledger(&self, wallet_id: Uuid) -> ControlPlaneResult<Vec<LedgerEntry>> {
        Ok(self.store.ledger_entries(wallet_id).await?)
    }

    /// Usage records of an instance, newest first
    pub async fn usage(&self, instance_id: Uuid) -> ControlPlaneResult<Vec<UsageRecord>> {
        Ok(self.store.usage_records(instance_id).await?)
    }
}
