//! In-memory store.
//!
//! A single mutex around all records makes every operation atomic. Used by
//! tests and single-process development setups.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    check_balance_change, BillingLock, InstanceTransition, Store, StoreError, StoreResult,
    UsageCharge, UsageOutcome,
};
use crate::control_plane::instance::{Instance, InstanceStatus};
use crate::control_plane::wallet::{
    BalanceChange, Deposit, DepositStatus, LedgerEntry, UsageRecord, Wallet,
};

#[derive(Debug, Default)]
struct State {
    wallets: HashMap<Uuid, Wallet>,
    wallet_by_user: HashMap<String, Uuid>,
    ledger: Vec<LedgerEntry>,
    deposits: HashMap<Uuid, Deposit>,
    instances: HashMap<Uuid, Instance>,
    usage: Vec<UsageRecord>,
    usage_windows: HashSet<(Uuid, DateTime<Utc>)>,
    /// Fault injection for tests; always empty otherwise
    failing_usage: HashSet<Uuid>,
    failing_transitions: HashSet<Uuid>,
}

impl State {
    /// The balance chokepoint
    fn apply_change(
        &mut self,
        change: &BalanceChange,
        now: DateTime<Utc>,
    ) -> StoreResult<(Wallet, LedgerEntry)> {
        check_balance_change(change)?;

        let wallet = self
            .wallets
            .get_mut(&change.wallet_id)
            .ok_or_else(|| StoreError::not_found("wallet", change.wallet_id))?;
        wallet.balance += change.amount;
        wallet.updated_at = now;

        let entry = change.entry(now);
        self.ledger.push(entry.clone());
        Ok((wallet.clone(), entry))
    }

    fn pending_deposit(&mut self, deposit_id: Uuid) -> StoreResult<&mut Deposit> {
        let deposit = self
            .deposits
            .get_mut(&deposit_id)
            .ok_or_else(|| StoreError::not_found("deposit", deposit_id))?;
        if deposit.status != DepositStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "deposit {} is already {}",
                deposit_id,
                deposit.status.as_str()
            )));
        }
        Ok(deposit)
    }
}

/// In-memory [`Store`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_usage` fail for one instance
    #[cfg(test)]
    pub async fn fail_usage_for(&self, instance_id: Uuid) {
        self.state.lock().await.failing_usage.insert(instance_id);
    }

    /// Make `transition_instance` fail for one instance
    #[cfg(test)]
    pub async fn fail_transitions_for(&self, instance_id: Uuid) {
        self.state.lock().await.failing_transitions.insert(instance_id);
    }

    /// Overwrite an instance as-is
    #[cfg(test)]
    pub async fn put_instance(&self, instance: Instance) {
        self.state
            .lock()
            .await
            .instances
            .insert(instance.id, instance);
    }
}

fn newest_first<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
    items
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_wallet(&self, user_id: &str) -> StoreResult<Wallet> {
        let mut state = self.state.lock().await;
        if let Some(wallet) = state
            .wallet_by_user
            .get(user_id)
            .and_then(|id| state.wallets.get(id))
        {
            return Ok(wallet.clone());
        }

        let wallet = Wallet::new(user_id);
        state.wallet_by_user.insert(user_id.to_string(), wallet.id);
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    async fn wallet(&self, wallet_id: Uuid) -> StoreResult<Option<Wallet>> {
        Ok(self.state.lock().await.wallets.get(&wallet_id).cloned())
    }

    async fn wallet_for_user(&self, user_id: &str) -> StoreResult<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_by_user
            .get(user_id)
            .and_then(|id| state.wallets.get(id))
            .cloned())
    }

    async fn apply_balance_change(
        &self,
        change: BalanceChange,
        now: DateTime<Utc>,
    ) -> StoreResult<(Wallet, LedgerEntry)> {
        self.state.lock().await.apply_change(&change, now)
    }

    async fn ledger_entries(&self, wallet_id: Uuid) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        // Push order breaks ties between entries with equal timestamps.
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|e| e.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn insert_deposit(&self, deposit: &Deposit) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.deposits.contains_key(&deposit.id) {
            return Err(StoreError::Conflict(format!(
                "deposit {} already exists",
                deposit.id
            )));
        }
        state.deposits.insert(deposit.id, deposit.clone());
        Ok(())
    }

    async fn deposits(&self, user_id: &str) -> StoreResult<Vec<Deposit>> {
        let state = self.state.lock().await;
        let deposits: Vec<Deposit> = state
            .deposits
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(deposits, |d| d.created_at))
    }

    async fn confirm_deposit(
        &self,
        deposit_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<(Deposit, Wallet)> {
        let mut state = self.state.lock().await;

        let deposit = state.pending_deposit(deposit_id)?.clone();
        let wallet_id = *state
            .wallet_by_user
            .get(&deposit.user_id)
            .ok_or_else(|| StoreError::not_found("wallet", &deposit.user_id))?;

        let (wallet, _) =
            state.apply_change(&BalanceChange::deposit(wallet_id, deposit.amount, deposit.id), now)?;

        let deposit = state.pending_deposit(deposit_id)?;
        deposit.status = DepositStatus::Confirmed;
        deposit.processed_at = Some(now);
        Ok((deposit.clone(), wallet))
    }

    async fn reject_deposit(&self, deposit_id: Uuid, now: DateTime<Utc>) -> StoreResult<Deposit> {
        let mut state = self.state.lock().await;
        let deposit = state.pending_deposit(deposit_id)?;
        deposit.status = DepositStatus::Rejected;
        deposit.processed_at = Some(now);
        Ok(deposit.clone())
    }

    async fn insert_instance(&self, instance: &Instance) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let taken = state
            .instances
            .values()
            .any(|i| i.id == instance.id || i.db_name == instance.db_name || i.db_user == instance.db_user);
        if taken {
            return Err(StoreError::Conflict(format!(
                "instance {} or its identifiers already exist",
                instance.id
            )));
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn instance(&self, instance_id: Uuid) -> StoreResult<Option<Instance>> {
        Ok(self.state.lock().await.instances.get(&instance_id).cloned())
    }

    async fn instances_for_user(&self, user_id: &str) -> StoreResult<Vec<Instance>> {
        let state = self.state.lock().await;
        let instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(instances, |i| i.created_at))
    }

    async fn instances_with_status(&self, status: InstanceStatus) -> StoreResult<Vec<Instance>> {
        let state = self.state.lock().await;
        let mut instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn transition_instance(
        &self,
        instance_id: Uuid,
        transition: InstanceTransition,
    ) -> StoreResult<Instance> {
        let mut state = self.state.lock().await;
        if state.failing_transitions.contains(&instance_id) {
            return Err(StoreError::Database("injected failure".to_string()));
        }
        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| StoreError::not_found("instance", instance_id))?;

        if instance.status != transition.from {
            return Err(StoreError::Conflict(format!(
                "instance {} is {}, expected {}",
                instance_id, instance.status, transition.from
            )));
        }

        instance.status = transition.to;
        if let Some(ciphertext) = transition.encrypted_password {
            instance.encrypted_password = ciphertext;
        }
        if let Some(start) = transition.billing_start {
            instance.last_billed_at = Some(start);
        }
        if let Some(at) = transition.terminated_at {
            instance.terminated_at = Some(at);
        }
        Ok(instance.clone())
    }

    async fn set_encrypted_password(&self, instance_id: Uuid, ciphertext: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| StoreError::not_found("instance", instance_id))?;
        instance.encrypted_password = ciphertext.to_string();
        Ok(())
    }

    async fn usage_record_exists(
        &self,
        instance_id: Uuid,
        start_time: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .usage_windows
            .contains(&(instance_id, start_time)))
    }

    async fn record_usage(&self, charge: &UsageCharge) -> StoreResult<UsageOutcome> {
        charge.validate()?;
        let mut state = self.state.lock().await;

        if state.failing_usage.contains(&charge.instance_id) {
            return Err(StoreError::Database("injected failure".to_string()));
        }

        let instance = state
            .instances
            .get(&charge.instance_id)
            .ok_or_else(|| StoreError::not_found("instance", charge.instance_id))?;
        let duplicate = StoreError::DuplicateWindow {
            instance_id: charge.instance_id,
            start_time: charge.start,
        };
        if instance.last_billed_at != Some(charge.start)
            || state.usage_windows.contains(&(charge.instance_id, charge.start))
        {
            return Err(duplicate);
        }

        let record = charge.record();

        // Everything below is validated first so nothing is half-applied.
        let wallet = match charge.balance_change(record.id) {
            Some(change) => {
                check_balance_change(&change)?;
                if !state.wallets.contains_key(&change.wallet_id) {
                    return Err(StoreError::not_found("wallet", change.wallet_id));
                }
                Some(state.apply_change(&change, charge.end)?.0)
            }
            None => None,
        };

        state.usage_windows.insert((charge.instance_id, charge.start));
        state.usage.push(record.clone());
        if let Some(instance) = state.instances.get_mut(&charge.instance_id) {
            instance.last_billed_at = Some(charge.end);
        }

        Ok(UsageOutcome { record, wallet })
    }

    async fn usage_records(&self, instance_id: Uuid) -> StoreResult<Vec<UsageRecord>> {
        let state = self.state.lock().await;
        let records: Vec<UsageRecord> = state
            .usage
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        Ok(newest_first(records, |r| r.start_time))
    }

    async fn try_billing_lock(&self) -> StoreResult<Option<BillingLock>> {
        Ok(Some(BillingLock::Local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::instance::CreateInstanceRequest;
    use crate::engines::Engine;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    async fn running_instance(store: &MemoryStore, start: DateTime<Utc>) -> Instance {
        let request = CreateInstanceRequest {
            user_id: "alice".to_string(),
            product_id: "mysql-small".to_string(),
            engine: Engine::Mysql,
            rate_per_hour: Decimal::new(2, 0),
            storage_size: None,
        };
        let instance = Instance::new(&request, "localhost");
        store.insert_instance(&instance).await.unwrap();

        let mut transition = InstanceTransition::new(InstanceStatus::Provisioning, InstanceStatus::Running);
        transition.billing_start = Some(start);
        store.transition_instance(instance.id, transition).await.unwrap()
    }

    fn charge(instance: &Instance, wallet_id: Option<Uuid>, minutes: i64) -> UsageCharge {
        let start = instance.last_billed_at.unwrap();
        UsageCharge {
            instance_id: instance.id,
            wallet_id,
            db_name: instance.db_name.clone(),
            start,
            end: start + Duration::minutes(minutes),
            rate_per_hour: instance.rate_per_hour,
            amount: instance.rate_per_hour * Decimal::from(minutes) / Decimal::from(60),
        }
    }

    #[tokio::test]
    async fn test_record_usage_is_all_or_nothing() {
        let store = MemoryStore::new();
        let wallet = store.ensure_wallet("alice").await.unwrap();
        let start = Utc::now() - Duration::hours(2);
        let instance = running_instance(&store, start).await;

        // Unknown wallet: nothing written, anchor unchanged.
        let err = store
            .record_usage(&charge(&instance, Some(Uuid::new_v4()), 60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "wallet", .. }));
        assert!(store.usage_records(instance.id).await.unwrap().is_empty());
        let reloaded = store.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_billed_at, Some(start));

        let outcome = store
            .record_usage(&charge(&instance, Some(wallet.id), 60))
            .await
            .unwrap();
        assert_eq!(outcome.wallet.unwrap().balance, Decimal::new(-2, 0));
        assert_eq!(outcome.record.duration_seconds, 3600);

        let reloaded = store.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_billed_at, Some(start + Duration::hours(1)));
        let ledger = store.ledger_entries(wallet.id).await.unwrap();
        assert_eq!(ledger[0].reference_id, Some(outcome.record.id));
    }

    #[tokio::test]
    async fn test_same_window_twice_is_duplicate() {
        let store = MemoryStore::new();
        let wallet = store.ensure_wallet("alice").await.unwrap();
        let instance = running_instance(&store, Utc::now() - Duration::hours(1)).await;

        let first = charge(&instance, Some(wallet.id), 30);
        store.record_usage(&first).await.unwrap();
        assert!(store
            .usage_record_exists(instance.id, first.start)
            .await
            .unwrap());

        let err = store.record_usage(&first).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateWindow { .. }));
        assert_eq!(store.ledger_entries(wallet.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_anchor_is_duplicate() {
        let store = MemoryStore::new();
        let wallet = store.ensure_wallet("alice").await.unwrap();
        let instance = running_instance(&store, Utc::now() - Duration::hours(1)).await;

        // A window that does not start at the current anchor overlaps a billed one.
        let mut stale = charge(&instance, Some(wallet.id), 10);
        stale.start -= Duration::minutes(5);
        let err = store.record_usage(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateWindow { .. }));
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = MemoryStore::new();
        let instance = running_instance(&store, Utc::now()).await;

        let err = store
            .transition_instance(
                instance.id,
                InstanceTransition::new(InstanceStatus::Suspended, InstanceStatus::Running),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let suspended = store
            .transition_instance(
                instance.id,
                InstanceTransition::new(InstanceStatus::Running, InstanceStatus::Suspended),
            )
            .await
            .unwrap();
        assert_eq!(suspended.status, InstanceStatus::Suspended);
    }

    #[tokio::test]
    async fn test_balance_change_sign_is_enforced() {
        let store = MemoryStore::new();
        let wallet = store.ensure_wallet("alice").await.unwrap();
        let mut change = BalanceChange::deposit(wallet.id, Decimal::new(5, 0), Uuid::new_v4());
        change.amount = Decimal::new(-5, 0);

        let err = store.apply_balance_change(change, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.ledger_entries(wallet.id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deposits_and_charges_keep_ledger_balanced() {
        let store = Arc::new(MemoryStore::new());
        let wallet_id = store.ensure_wallet("alice").await.unwrap().id;
        let instance = running_instance(&store, Utc::now() - Duration::hours(1)).await;

        let mut deposit_ids = Vec::new();
        for _ in 0..20 {
            let deposit = Deposit {
                id: Uuid::new_v4(),
                user_id: "alice".to_string(),
                amount: Decimal::new(5, 0),
                status: DepositStatus::Pending,
                created_at: Utc::now(),
                processed_at: None,
            };
            store.insert_deposit(&deposit).await.unwrap();
            deposit_ids.push(deposit.id);
        }

        let depositor = {
            let store = store.clone();
            tokio::spawn(async move {
                for id in deposit_ids {
                    store.confirm_deposit(id, Utc::now()).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let biller = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut current = instance;
                for _ in 0..20 {
                    store
                        .record_usage(&charge(&current, Some(wallet_id), 3))
                        .await
                        .unwrap();
                    current = store.instance(current.id).await.unwrap().unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let (deposits, charges) = tokio::join!(depositor, biller);
        deposits.unwrap();
        charges.unwrap();

        let wallet = store.wallet(wallet_id).await.unwrap().unwrap();
        let ledger = store.ledger_entries(wallet_id).await.unwrap();
        assert_eq!(ledger.len(), 40);
        let total: Decimal = ledger.iter().map(|e| e.amount).sum();
        assert_eq!(total, wallet.balance);
        // 20 deposits of 5, 20 three-minute windows at 2/h
        assert_eq!(wallet.balance, Decimal::new(98, 0));
    }
}
