//! # Engine Adapters
//!
//! One adapter per supported database engine. Every adapter implements the
//! same lifecycle contract so the agent never branches on engine-specific
//! behaviour:
//!
//! - `create`: idempotent; an existing database/user is a no-op success
//! - `suspend`: blocks data-plane access, keeps data and the user object
//! - `resume`: restores exactly the access `suspend` removed
//! - `terminate`: idempotent, drops user and database
//! - `rotate_password`: the old credential stops working once it returns
//!
//! ## Components
//!
//! - `postgres`: login-disable + backend termination
//! - `mysql`: privilege revocation
//! - `mongo`: role-binding revocation
//! - `quoting`: identifier/literal escaping for administrative statements
//! - `registry`: engine tag to adapter mapping

pub mod errors;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod quoting;
pub mod registry;

pub use errors::{AdapterError, AdapterResult, FailureKind};
pub use registry::AdapterRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// PostgreSQL (relational)
    Postgresql,
    /// MySQL (relational)
    Mysql,
    /// MongoDB (document store)
    Mongodb,
}

impl Engine {
    /// Every supported engine
    pub const ALL: [Engine; 3] = [Engine::Postgresql, Engine::Mysql, Engine::Mongodb];

    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Mongodb => "mongodb",
        }
    }

    /// Port advertised to users for instances of this engine
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgresql => 5433,
            Self::Mysql => 3306,
            Self::Mongodb => 27017,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgresql" => Ok(Self::Postgresql),
            "mysql" => Ok(Self::Mysql),
            "mongodb" => Ok(Self::Mongodb),
            other => Err(format!("unsupported engine '{}'", other)),
        }
    }
}

/// Lifecycle contract every engine adapter implements.
///
/// A failed call leaves nothing the caller may rely on as partial success.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Engine this adapter drives
    fn engine(&self) -> Engine;

    /// Create database and user, granting the user full access to the database
    async fn create(&self, db_name: &str, db_user: &str, password: &str) -> AdapterResult<()>;

    /// Revoke data-plane access without dropping anything
    async fn suspend(&self, db_name: &str, db_user: &str) -> AdapterResult<()>;

    /// Undo `suspend`
    async fn resume(&self, db_name: &str, db_user: &str) -> AdapterResult<()>;

    /// Drop user and database
    async fn terminate(&self, db_name: &str, db_user: &str) -> AdapterResult<()>;

    /// Replace the user's credential
    async fn rotate_password(&self, db_user: &str, new_password: &str) -> AdapterResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_tags() {
        for engine in Engine::ALL {
            assert_eq!(engine.as_str().parse::<Engine>().unwrap(), engine);
            let json = serde_json::to_string(&engine).unwrap();
            assert_eq!(json, format!("\"{}\"", engine));
        }
        assert!("postgres".parse::<Engine>().is_err());
        assert!("redis".parse::<Engine>().is_err());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Engine::Postgresql.default_port(), 5433);
        assert_eq!(Engine::Mysql.default_port(), 3306);
        assert_eq!(Engine::Mongodb.default_port(), 27017);
    }
}
