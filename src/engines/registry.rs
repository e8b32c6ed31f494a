//! # Adapter Registry
//!
//! Maps each [`Engine`] to exactly one adapter. Handles are built once at
//! process start and shared by every request for that engine.

use std::sync::Arc;

use super::mongo::MongoAdapter;
use super::mysql::MySqlAdapter;
use super::postgres::PostgresAdapter;
use super::{AdapterResult, Engine, EngineAdapter};

/// Connection settings for all engines
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub postgres_admin_url: String,
    pub mysql_admin_url: String,
    pub mongodb_url: String,
    pub pool_size: u32,
}

/// One adapter per engine
#[derive(Clone)]
pub struct AdapterRegistry {
    postgresql: Arc<dyn EngineAdapter>,
    mysql: Arc<dyn EngineAdapter>,
    mongodb: Arc<dyn EngineAdapter>,
}

impl AdapterRegistry {
    /// Create from explicit adapters
    pub fn new(
        postgresql: Arc<dyn EngineAdapter>,
        mysql: Arc<dyn EngineAdapter>,
        mongodb: Arc<dyn EngineAdapter>,
    ) -> Self {
        Self {
            postgresql,
            mysql,
            mongodb,
        }
    }

    /// Build the production adapters. Pools connect lazily, so an engine
    /// being down at startup only fails requests for that engine.
    pub async fn connect(settings: &AdapterSettings) -> AdapterResult<Self> {
        let postgresql =
            PostgresAdapter::connect_lazy(&settings.postgres_admin_url, settings.pool_size)?;
        let mysql = MySqlAdapter::connect_lazy(&settings.mysql_admin_url, settings.pool_size)?;
        let mongodb = MongoAdapter::connect(&settings.mongodb_url, settings.pool_size).await?;

        Ok(Self::new(
            Arc::new(postgresql),
            Arc::new(mysql),
            Arc::new(mongodb),
        ))
    }

    /// Adapter for an engine
    pub fn adapter(&self, engine: Engine) -> &dyn EngineAdapter {
        match engine {
            Engine::Postgresql => self.postgresql.as_ref(),
            Engine::Mysql => self.mysql.as_ref(),
            Engine::Mongodb => self.mongodb.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAdapter;

    #[test]
    fn test_each_engine_resolves_to_its_adapter() {
        let registry = AdapterRegistry::new(
            Arc::new(RecordingAdapter::new(Engine::Postgresql)),
            Arc::new(RecordingAdapter::new(Engine::Mysql)),
            Arc::new(RecordingAdapter::new(Engine::Mongodb)),
        );

        for engine in Engine::ALL {
            assert_eq!(registry.adapter(engine).engine(), engine);
        }
    }
}
