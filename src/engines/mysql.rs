//! # MySQL Adapter
//!
//! Suspension revokes the user's privileges on its database; the account
//! and data stay in place and `resume` grants the same privileges back.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Executor;
use tracing::info;

use super::errors::{AdapterError, AdapterResult};
use super::quoting::{mysql_account, mysql_identifier, mysql_literal, QuoteError};
use super::{Engine, EngineAdapter};

/// MySQL adapter holding a pool of root connections
#[derive(Debug, Clone)]
pub struct MySqlAdapter {
    pool: MySqlPool,
}

impl MySqlAdapter {
    /// Wrap an existing pool
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Build a lazily-connecting pool from an admin URL
    pub fn connect_lazy(admin_url: &str, max_connections: u32) -> AdapterResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(admin_url)
            .map_err(AdapterError::from_sqlx)?;
        Ok(Self { pool })
    }

    /// Run statements in order on one connection, stopping at the first failure
    async fn exec_all(&self, statements: &[String]) -> AdapterResult<()> {
        let mut conn = self.pool.acquire().await.map_err(AdapterError::from_sqlx)?;
        for sql in statements {
            conn.execute(sqlx::raw_sql(sql))
                .await
                .map_err(AdapterError::from_sqlx)?;
        }
        Ok(())
    }
}

fn grant_sql(db_name: &str, db_user: &str) -> Result<String, QuoteError> {
    Ok(format!(
        "GRANT ALL PRIVILEGES ON {}.* TO {}",
        mysql_identifier(db_name)?,
        mysql_account(db_user)?
    ))
}

fn revoke_sql(db_name: &str, db_user: &str) -> Result<String, QuoteError> {
    Ok(format!(
        "REVOKE ALL PRIVILEGES ON {}.* FROM {}",
        mysql_identifier(db_name)?,
        mysql_account(db_user)?
    ))
}

fn create_statements(db_name: &str, db_user: &str, password: &str) -> Result<Vec<String>, QuoteError> {
    Ok(vec![
        format!("CREATE DATABASE IF NOT EXISTS {}", mysql_identifier(db_name)?),
        format!(
            "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {}",
            mysql_account(db_user)?,
            mysql_literal(password)?
        ),
        grant_sql(db_name, db_user)?,
        "FLUSH PRIVILEGES".to_string(),
    ])
}

fn terminate_statements(db_name: &str, db_user: &str) -> Result<Vec<String>, QuoteError> {
    Ok(vec![
        format!("DROP USER IF EXISTS {}", mysql_account(db_user)?),
        format!("DROP DATABASE IF EXISTS {}", mysql_identifier(db_name)?),
        "FLUSH PRIVILEGES".to_string(),
    ])
}

fn rotate_statements(db_user: &str, password: &str) -> Result<Vec<String>, QuoteError> {
    Ok(vec![
        format!(
            "ALTER USER {} IDENTIFIED BY {}",
            mysql_account(db_user)?,
            mysql_literal(password)?
        ),
        "FLUSH PRIVILEGES".to_string(),
    ])
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    fn engine(&self) -> Engine {
        Engine::Mysql
    }

    async fn create(&self, db_name: &str, db_user: &str, password: &str) -> AdapterResult<()> {
        self.exec_all(&create_statements(db_name, db_user, password)?)
            .await?;
        info!(db_name, db_user, "mysql database provisioned");
        Ok(())
    }

    async fn suspend(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.exec_all(&[revoke_sql(db_name, db_user)?, "FLUSH PRIVILEGES".to_string()])
            .await
    }

    async fn resume(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.exec_all(&[grant_sql(db_name, db_user)?, "FLUSH PRIVILEGES".to_string()])
            .await
    }

    async fn terminate(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.exec_all(&terminate_statements(db_name, db_user)?).await?;
        info!(db_name, db_user, "mysql database dropped");
        Ok(())
    }

    async fn rotate_password(&self, db_user: &str, new_password: &str) -> AdapterResult<()> {
        self.exec_all(&rotate_statements(db_user, new_password)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent_sql() {
        let stmts = create_statements("db_1", "user_1", "pw").unwrap();
        assert_eq!(stmts[0], "CREATE DATABASE IF NOT EXISTS `db_1`");
        assert_eq!(stmts[1], "CREATE USER IF NOT EXISTS 'user_1'@'%' IDENTIFIED BY 'pw'");
        assert_eq!(stmts[2], "GRANT ALL PRIVILEGES ON `db_1`.* TO 'user_1'@'%'");
        assert_eq!(stmts[3], "FLUSH PRIVILEGES");
    }

    #[test]
    fn test_suspend_resume_are_symmetric() {
        let revoke = revoke_sql("db_1", "user_1").unwrap();
        let grant = grant_sql("db_1", "user_1").unwrap();
        assert_eq!(revoke, "REVOKE ALL PRIVILEGES ON `db_1`.* FROM 'user_1'@'%'");
        assert_eq!(
            revoke.replace("REVOKE", "GRANT").replace("FROM", "TO"),
            grant
        );
    }

    #[test]
    fn test_terminate_uses_if_exists() {
        let stmts = terminate_statements("db_1", "user_1").unwrap();
        assert!(stmts.iter().take(2).all(|s| s.contains("IF EXISTS")));
    }

    #[test]
    fn test_rotate_escapes_password() {
        let stmts = rotate_statements("user_1", "a'b").unwrap();
        assert_eq!(stmts[0], "ALTER USER 'user_1'@'%' IDENTIFIED BY 'a''b'");
        assert!(rotate_statements("user_1", "a\\b").is_err());
    }
}
