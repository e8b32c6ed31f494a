//! PostgreSQL store.
//!
//! Multi-record writes run in one transaction. Balance changes are a single
//! `UPDATE ... SET balance = balance + $n`, which row-locks the wallet, so a
//! deposit and a charge racing on the same wallet serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    check_balance_change, BillingLock, InstanceTransition, Store, StoreError, StoreResult,
    UsageCharge, UsageOutcome,
};
use crate::control_plane::instance::{Instance, InstanceStatus};
use crate::control_plane::wallet::{
    BalanceChange, Deposit, DepositStatus, LedgerEntry, UsageRecord, Wallet,
};

/// Schema applied by [`PgStore::migrate`]
pub const SCHEMA: &str = include_str!("../../../migrations/schema.sql");

/// Session advisory lock key held for the duration of a billing pass
pub const BILLING_LOCK_KEY: i64 = 0x6462_6161_735f_6269;

const WALLET_COLUMNS: &str = "id, user_id, balance, created_at, updated_at";
const LEDGER_COLUMNS: &str = "id, wallet_id, type, amount, description, reference_id, created_at";
const DEPOSIT_COLUMNS: &str = "id, user_id, amount, status, created_at, processed_at";
const USAGE_COLUMNS: &str =
    "id, instance_id, start_time, end_time, duration_seconds, rate_per_hour, amount";
const INSTANCE_COLUMNS: &str = "id, user_id, product_id, engine, status, db_name, db_user, \
     encrypted_password, host, port, rate_per_hour, storage_size, last_billed_at, created_at, \
     terminated_at";

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    wallet_id: Uuid,
    #[sqlx(rename = "type")]
    entry_type: String,
    amount: Decimal,
    description: String,
    reference_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            wallet_id: row.wallet_id,
            entry_type: row.entry_type.parse().map_err(StoreError::Database)?,
            amount: row.amount,
            description: row.description,
            reference_id: row.reference_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DepositRow {
    id: Uuid,
    user_id: String,
    amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DepositRow> for Deposit {
    type Error = StoreError;

    fn try_from(row: DepositRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            status: row.status.parse().map_err(StoreError::Database)?,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    user_id: String,
    product_id: String,
    engine: String,
    status: String,
    db_name: String,
    db_user: String,
    encrypted_password: String,
    host: String,
    port: i32,
    rate_per_hour: Decimal,
    storage_size: Option<i32>,
    last_billed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    terminated_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> StoreResult<Self> {
        let port = u16::try_from(row.port)
            .map_err(|_| StoreError::Database(format!("invalid port {}", row.port)))?;
        let storage_size = row
            .storage_size
            .map(u32::try_from)
            .transpose()
            .map_err(|_| StoreError::Database("invalid storage size".to_string()))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            product_id: row.product_id,
            engine: row.engine.parse().map_err(StoreError::Database)?,
            status: row.status.parse().map_err(StoreError::Database)?,
            db_name: row.db_name,
            db_user: row.db_user,
            encrypted_password: row.encrypted_password,
            host: row.host,
            port,
            rate_per_hour: row.rate_per_hour,
            storage_size,
            last_billed_at: row.last_billed_at,
            created_at: row.created_at,
            terminated_at: row.terminated_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// The balance chokepoint. Must run inside the caller's transaction.
async fn apply_change(
    conn: &mut PgConnection,
    change: &BalanceChange,
    now: DateTime<Utc>,
) -> StoreResult<(Wallet, LedgerEntry)> {
    check_balance_change(change)?;

    let sql = format!(
        "UPDATE wallets SET balance = balance + $2, updated_at = $3 WHERE id = $1 RETURNING {}",
        WALLET_COLUMNS
    );
    let wallet = sqlx::query_as::<_, Wallet>(&sql)
        .bind(change.wallet_id)
        .bind(change.amount)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("wallet", change.wallet_id))?;

    let entry = change.entry(now);
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, wallet_id, type, amount, description, reference_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.wallet_id)
    .bind(entry.entry_type.as_str())
    .bind(entry.amount)
    .bind(&entry.description)
    .bind(entry.reference_id)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    Ok((wallet, entry))
}

/// Pending deposit, row-locked
async fn lock_pending_deposit(conn: &mut PgConnection, deposit_id: Uuid) -> StoreResult<Deposit> {
    let sql = format!("SELECT {} FROM deposits WHERE id = $1 FOR UPDATE", DEPOSIT_COLUMNS);
    let deposit: Deposit = sqlx::query_as::<_, DepositRow>(&sql)
        .bind(deposit_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("deposit", deposit_id))?
        .try_into()?;

    if deposit.status != DepositStatus::Pending {
        return Err(StoreError::Conflict(format!(
            "deposit {} is already {}",
            deposit_id,
            deposit.status.as_str()
        )));
    }
    Ok(deposit)
}

/// Session advisory lock pinned to one pooled connection.
///
/// Released explicitly with [`AdvisoryLock::release`]. If dropped instead,
/// the connection is detached from the pool and closed, which also frees
/// the lock.
pub struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
}

impl std::fmt::Debug for AdvisoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLock")
            .field("key", &BILLING_LOCK_KEY)
            .field("held", &self.conn.is_some())
            .finish()
    }
}

impl AdvisoryLock {
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(BILLING_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            warn!(error = %e, "failed to release billing lock, closing connection");
            drop(conn.detach());
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// PostgreSQL-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create missing tables and indexes
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("control plane schema applied");
        Ok(())
    }

    async fn instance_exists(&self, instance_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM instances WHERE id = $1)")
            .bind(instance_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_wallet(&self, user_id: &str) -> StoreResult<Wallet> {
        let wallet = Wallet::new(user_id);
        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id, balance, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(wallet.id)
        .bind(user_id)
        .bind(wallet.created_at)
        .execute(&self.pool)
        .await?;

        self.wallet_for_user(user_id)
            .await?
            .ok_or_else(|| StoreError::not_found("wallet", user_id))
    }

    async fn wallet(&self, wallet_id: Uuid) -> StoreResult<Option<Wallet>> {
        let sql = format!("SELECT {} FROM wallets WHERE id = $1", WALLET_COLUMNS);
        Ok(sqlx::query_as::<_, Wallet>(&sql)
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn wallet_for_user(&self, user_id: &str) -> StoreResult<Option<Wallet>> {
        let sql = format!("SELECT {} FROM wallets WHERE user_id = $1", WALLET_COLUMNS);
        Ok(sqlx::query_as::<_, Wallet>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn apply_balance_change(
        &self,
        change: BalanceChange,
        now: DateTime<Utc>,
    ) -> StoreResult<(Wallet, LedgerEntry)> {
        let mut tx = self.pool.begin().await?;
        let result = apply_change(&mut tx, &change, now).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn ledger_entries(&self, wallet_id: Uuid) -> StoreResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE wallet_id = $1 ORDER BY created_at DESC",
            LEDGER_COLUMNS
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(wallet_id)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn insert_deposit(&self, deposit: &Deposit) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deposits (id, user_id, amount, status, created_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(deposit.id)
        .bind(&deposit.user_id)
        .bind(deposit.amount)
        .bind(deposit.status.as_str())
        .bind(deposit.created_at)
        .bind(deposit.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deposits(&self, user_id: &str) -> StoreResult<Vec<Deposit>> {
        let sql = format!(
            "SELECT {} FROM deposits WHERE user_id = $1 ORDER BY created_at DESC",
            DEPOSIT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DepositRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn confirm_deposit(
        &self,
        deposit_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<(Deposit, Wallet)> {
        let mut tx = self.pool.begin().await?;

        let mut deposit = lock_pending_deposit(&mut tx, deposit_id).await?;
        let wallet_id: Uuid = sqlx::query_scalar("SELECT id FROM wallets WHERE user_id = $1")
            .bind(&deposit.user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("wallet", &deposit.user_id))?;

        let (wallet, _) = apply_change(
            &mut tx,
            &BalanceChange::deposit(wallet_id, deposit.amount, deposit.id),
            now,
        )
        .await?;

        sqlx::query("UPDATE deposits SET status = 'confirmed', processed_at = $2 WHERE id = $1")
            .bind(deposit_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        deposit.status = DepositStatus::Confirmed;
        deposit.processed_at = Some(now);
        Ok((deposit, wallet))
    }

    async fn reject_deposit(&self, deposit_id: Uuid, now: DateTime<Utc>) -> StoreResult<Deposit> {
        let mut tx = self.pool.begin().await?;

        let mut deposit = lock_pending_deposit(&mut tx, deposit_id).await?;
        sqlx::query("UPDATE deposits SET status = 'rejected', processed_at = $2 WHERE id = $1")
            .bind(deposit_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        deposit.status = DepositStatus::Rejected;
        deposit.processed_at = Some(now);
        Ok(deposit)
    }

    async fn insert_instance(&self, instance: &Instance) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, user_id, product_id, engine, status, db_name, db_user,
                encrypted_password, host, port, rate_per_hour, storage_size,
                last_billed_at, created_at, terminated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.user_id)
        .bind(&instance.product_id)
        .bind(instance.engine.as_str())
        .bind(instance.status.as_str())
        .bind(&instance.db_name)
        .bind(&instance.db_user)
        .bind(&instance.encrypted_password)
        .bind(&instance.host)
        .bind(i32::from(instance.port))
        .bind(instance.rate_per_hour)
        .bind(instance.storage_size.map(|s| s as i32))
        .bind(instance.last_billed_at)
        .bind(instance.created_at)
        .bind(instance.terminated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn instance(&self, instance_id: Uuid) -> StoreResult<Option<Instance>> {
        let sql = format!("SELECT {} FROM instances WHERE id = $1", INSTANCE_COLUMNS);
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Instance::try_from)
            .transpose()
    }

    async fn instances_for_user(&self, user_id: &str) -> StoreResult<Vec<Instance>> {
        let sql = format!(
            "SELECT {} FROM instances WHERE user_id = $1 ORDER BY created_at DESC",
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn instances_with_status(&self, status: InstanceStatus) -> StoreResult<Vec<Instance>> {
        let sql = format!(
            "SELECT {} FROM instances WHERE status = $1 ORDER BY created_at",
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn transition_instance(
        &self,
        instance_id: Uuid,
        transition: InstanceTransition,
    ) -> StoreResult<Instance> {
        let sql = format!(
            r#"
            UPDATE instances
            SET status = $3,
                encrypted_password = COALESCE($4, encrypted_password),
                last_billed_at = COALESCE($5, last_billed_at),
                terminated_at = COALESCE($6, terminated_at)
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(instance_id)
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(transition.encrypted_password)
            .bind(transition.billing_start)
            .bind(transition.terminated_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return row.try_into();
        }

        if self.instance_exists(instance_id).await? {
            Err(StoreError::Conflict(format!(
                "instance {} is not {}",
                instance_id, transition.from
            )))
        } else {
            Err(StoreError::not_found("instance", instance_id))
        }
    }

    async fn set_encrypted_password(&self, instance_id: Uuid, ciphertext: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE instances SET encrypted_password = $2 WHERE id = $1")
            .bind(instance_id)
            .bind(ciphertext)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("instance", instance_id));
        }
        Ok(())
    }

    async fn usage_record_exists(
        &self,
        instance_id: Uuid,
        start_time: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM usage_records WHERE instance_id = $1 AND start_time = $2)",
        )
        .bind(instance_id)
        .bind(start_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_usage(&self, charge: &UsageCharge) -> StoreResult<UsageOutcome> {
        charge.validate()?;
        let duplicate = || StoreError::DuplicateWindow {
            instance_id: charge.instance_id,
            start_time: charge.start,
        };

        let mut tx = self.pool.begin().await?;

        let anchor: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_billed_at FROM instances WHERE id = $1 FOR UPDATE")
                .bind(charge.instance_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("instance", charge.instance_id))?;
        if anchor != Some(charge.start) {
            return Err(duplicate());
        }

        let record = charge.record();
        let inserted = sqlx::query(
            r#"
            INSERT INTO usage_records (id, instance_id, start_time, end_time, duration_seconds, rate_per_hour, amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (instance_id, start_time) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.instance_id)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.duration_seconds)
        .bind(record.rate_per_hour)
        .bind(record.amount)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(duplicate());
        }

        let wallet = match charge.balance_change(record.id) {
            Some(change) => Some(apply_change(&mut tx, &change, charge.end).await?.0),
            None => None,
        };

        sqlx::query("UPDATE instances SET last_billed_at = $2 WHERE id = $1")
            .bind(charge.instance_id)
            .bind(charge.end)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(UsageOutcome { record, wallet })
    }

    async fn usage_records(&self, instance_id: Uuid) -> StoreResult<Vec<UsageRecord>> {
        let sql = format!(
            "SELECT {} FROM usage_records WHERE instance_id = $1 ORDER BY start_time DESC",
            USAGE_COLUMNS
        );
        Ok(sqlx::query_as::<_, UsageRecord>(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn try_billing_lock(&self) -> StoreResult<Option<BillingLock>> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(BILLING_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;

        Ok(acquired.then(|| BillingLock::Advisory(AdvisoryLock { conn: Some(conn) })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_row() -> InstanceRow {
        InstanceRow {
            id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            product_id: "pg-small".to_string(),
            engine: "postgresql".to_string(),
            status: "running".to_string(),
            db_name: "db_01234567".to_string(),
            db_user: "user_01234567".to_string(),
            encrypted_password: String::new(),
            host: "localhost".to_string(),
            port: 5433,
            rate_per_hour: Decimal::new(75, 1),
            storage_size: Some(1),
            last_billed_at: Some(Utc::now()),
            created_at: Utc::now(),
            terminated_at: None,
        }
    }

    #[test]
    fn test_instance_row_conversion() {
        let instance = Instance::try_from(instance_row()).unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.port, 5433);
        assert_eq!(instance.storage_size, Some(1));
    }

    #[test]
    fn test_corrupt_rows_are_database_errors() {
        let mut row = instance_row();
        row.status = "paused".to_string();
        assert!(matches!(Instance::try_from(row), Err(StoreError::Database(_))));

        let mut row = instance_row();
        row.port = 70000;
        assert!(matches!(Instance::try_from(row), Err(StoreError::Database(_))));

        let row = LedgerRow {
            id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            entry_type: "withdrawal".to_string(),
            amount: Decimal::ONE,
            description: String::new(),
            reference_id: None,
            created_at: Utc::now(),
        };
        assert!(LedgerEntry::try_from(row).is_err());
    }

    #[test]
    fn test_schema_enforces_window_uniqueness() {
        assert!(SCHEMA.contains("UNIQUE (instance_id, start_time)"));
        for table in ["wallets", "ledger_entries", "instances", "usage_records", "deposits"] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", table)),
                "missing table {}",
                table
            );
        }
    }
}
