//! # PostgreSQL Adapter
//!
//! Suspension disables login and terminates the user's live backends. The
//! role, its grants and the database are left untouched.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::errors::{AdapterError, AdapterResult};
use super::quoting::{pg_identifier, pg_literal, QuoteError};
use super::{Engine, EngineAdapter};

/// PostgreSQL adapter holding a pool of superuser connections
#[derive(Debug, Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a lazily-connecting pool from an admin URL
    pub fn connect_lazy(admin_url: &str, max_connections: u32) -> AdapterResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(admin_url)
            .map_err(AdapterError::from_sqlx)?;
        Ok(Self { pool })
    }

    async fn exec(&self, sql: &str) -> AdapterResult<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(AdapterError::from_sqlx)?;
        Ok(())
    }

    async fn role_exists(&self, db_user: &str) -> AdapterResult<bool> {
        let row: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_roles WHERE rolname = $1")
            .bind(db_user)
            .fetch_optional(&self.pool)
            .await
            .map_err(AdapterError::from_sqlx)?;
        Ok(row.is_some())
    }

    async fn database_exists(&self, db_name: &str) -> AdapterResult<bool> {
        let row: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(db_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(AdapterError::from_sqlx)?;
        Ok(row.is_some())
    }
}

fn create_user_sql(db_user: &str, password: &str) -> Result<String, QuoteError> {
    Ok(format!(
        "CREATE USER {} WITH PASSWORD {}",
        pg_identifier(db_user)?,
        pg_literal(password)?
    ))
}

fn create_database_sql(db_name: &str, db_user: &str) -> Result<String, QuoteError> {
    Ok(format!(
        "CREATE DATABASE {} OWNER {}",
        pg_identifier(db_name)?,
        pg_identifier(db_user)?
    ))
}

fn grant_sql(db_name: &str, db_user: &str) -> Result<String, QuoteError> {
    Ok(format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
        pg_identifier(db_name)?,
        pg_identifier(db_user)?
    ))
}

fn login_sql(db_user: &str, enabled: bool) -> Result<String, QuoteError> {
    let flag = if enabled { "LOGIN" } else { "NOLOGIN" };
    Ok(format!("ALTER USER {} {}", pg_identifier(db_user)?, flag))
}

fn password_sql(db_user: &str, password: &str) -> Result<String, QuoteError> {
    Ok(format!(
        "ALTER USER {} WITH PASSWORD {}",
        pg_identifier(db_user)?,
        pg_literal(password)?
    ))
}

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgresql
    }

    async fn create(&self, db_name: &str, db_user: &str, password: &str) -> AdapterResult<()> {
        // Quote everything up front so bad input fails before any side effect
        let create_user = create_user_sql(db_user, password)?;
        let create_db = create_database_sql(db_name, db_user)?;
        let grant = grant_sql(db_name, db_user)?;

        if self.role_exists(db_user).await? {
            debug!(db_user, "postgres role already exists");
        } else {
            self.exec(&create_user).await?;
        }

        if self.database_exists(db_name).await? {
            debug!(db_name, "postgres database already exists");
        } else {
            self.exec(&create_db).await?;
        }

        self.exec(&grant).await?;
        info!(db_name, db_user, "postgres database provisioned");
        Ok(())
    }

    async fn suspend(&self, _db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.exec(&login_sql(db_user, false)?).await?;
        sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE usename = $1")
            .bind(db_user)
            .execute(&self.pool)
            .await
            .map_err(AdapterError::from_sqlx)?;
        Ok(())
    }

    async fn resume(&self, _db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.exec(&login_sql(db_user, true)?).await
    }

    async fn terminate(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        let drop_db = format!("DROP DATABASE IF EXISTS {}", pg_identifier(db_name)?);
        let drop_user = format!("DROP USER IF EXISTS {}", pg_identifier(db_user)?);

        sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1")
            .bind(db_name)
            .execute(&self.pool)
            .await
            .map_err(AdapterError::from_sqlx)?;
        self.exec(&drop_db).await?;
        self.exec(&drop_user).await?;
        info!(db_name, db_user, "postgres database dropped");
        Ok(())
    }

    async fn rotate_password(&self, db_user: &str, new_password: &str) -> AdapterResult<()> {
        self.exec(&password_sql(db_user, new_password)?).await
    }
}
