//! Configuration loading from environment variables.
//!
//! `main` loads a `.env` file first when one is present.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentClientConfig, ProvisioningAgent};
use crate::config_validator::{ConfigResult, ConfigValidator};
use crate::control_plane::{InstanceLifecycleManager, Store};
use crate::credentials::CredentialCodec;
use crate::engines::registry::AdapterSettings;

const MIN_ENCRYPTION_KEY_LEN: usize = 16;

/// Provisioning agent configuration
#[derive(Clone)]
pub struct AgentConfig {
    /// Shared secret expected in `X-Agent-Token`
    pub token: String,
    pub port: u16,
    pub adapters: AdapterSettings,
    pub password_length: usize,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `AGENT_TOKEN`
    /// - `POSTGRES_ADMIN_URL`, `MYSQL_ADMIN_URL`, `MONGODB_URL`
    ///
    /// Optional (with defaults):
    /// - `AGENT_PORT` (4001)
    /// - `ADAPTER_POOL_SIZE` (10)
    /// - `PASSWORD_LENGTH` (24)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            token: required(&lookup, "AGENT_TOKEN")?,
            port: parsed(&lookup, "AGENT_PORT", 4001, "must be a valid port number")?,
            adapters: AdapterSettings {
                postgres_admin_url: required(&lookup, "POSTGRES_ADMIN_URL")?,
                mysql_admin_url: required(&lookup, "MYSQL_ADMIN_URL")?,
                mongodb_url: required(&lookup, "MONGODB_URL")?,
                pool_size: parsed(&lookup, "ADAPTER_POOL_SIZE", 10, "must be a positive integer")?,
            },
            password_length: parsed(&lookup, "PASSWORD_LENGTH", 24, "must be a positive integer")?,
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut v = ConfigValidator::new();
        v.validate_secret("AGENT_TOKEN", &self.token, 1)
            .validate_port("AGENT_PORT", self.port)
            .validate_url_scheme(
                "POSTGRES_ADMIN_URL",
                &self.adapters.postgres_admin_url,
                &["postgres", "postgresql"],
            )
            .validate_url_scheme("MYSQL_ADMIN_URL", &self.adapters.mysql_admin_url, &["mysql"])
            .validate_url_scheme(
                "MONGODB_URL",
                &self.adapters.mongodb_url,
                &["mongodb", "mongodb+srv"],
            )
            .validate_range("ADAPTER_POOL_SIZE", self.adapters.pool_size as i64, 1, 1000)
            .validate_range("PASSWORD_LENGTH", self.password_length as i64, 12, 128);
        v.finish()
    }
}

/// Billing process configuration
#[derive(Clone)]
pub struct BillingConfig {
    pub database_url: String,
    pub database_pool_size: u32,
    pub agent_url: String,
    pub agent_token: String,
    pub agent_timeout: Duration,
    pub agent_max_retries: u32,
    pub billing_interval: Duration,
}

impl BillingConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    /// - `AGENT_TOKEN`
    ///
    /// Optional (with defaults):
    /// - `DATABASE_POOL_SIZE` (10)
    /// - `AGENT_URL` (`http://localhost:4001`)
    /// - `AGENT_TIMEOUT_SECS` (30)
    /// - `AGENT_MAX_RETRIES` (2)
    /// - `BILLING_INTERVAL_SECS` (300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let timeout_secs: u64 =
            parsed(&lookup, "AGENT_TIMEOUT_SECS", 30, "must be a whole number of seconds")?;
        let interval_secs: u64 =
            parsed(&lookup, "BILLING_INTERVAL_SECS", 300, "must be a whole number of seconds")?;

        Ok(Self {
            database_url: required(&lookup, "DATABASE_URL")?,
            database_pool_size: parsed(&lookup, "DATABASE_POOL_SIZE", 10, "must be a positive integer")?,
            agent_url: lookup("AGENT_URL").unwrap_or_else(|| "http://localhost:4001".to_string()),
            agent_token: required(&lookup, "AGENT_TOKEN")?,
            agent_timeout: Duration::from_secs(timeout_secs),
            agent_max_retries: parsed(&lookup, "AGENT_MAX_RETRIES", 2, "must be a non-negative integer")?,
            billing_interval: Duration::from_secs(interval_secs),
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut v = ConfigValidator::new();
        self.check(&mut v);
        v.finish()
    }

    fn check(&self, v: &mut ConfigValidator) {
        v.validate_url_scheme("DATABASE_URL", &self.database_url, &["postgres", "postgresql"])
            .validate_range("DATABASE_POOL_SIZE", self.database_pool_size as i64, 1, 1000)
            .validate_url("AGENT_URL", &self.agent_url)
            .validate_secret("AGENT_TOKEN", &self.agent_token, 1)
            .validate_duration_secs("AGENT_TIMEOUT_SECS", self.agent_timeout.as_secs(), 1, 600)
            .validate_range("AGENT_MAX_RETRIES", self.agent_max_retries as i64, 0, 10)
            .validate_duration_secs("BILLING_INTERVAL_SECS", self.billing_interval.as_secs(), 60, 86_400);
    }

    pub fn agent_client(&self) -> AgentClientConfig {
        AgentClientConfig {
            base_url: self.agent_url.clone(),
            token: self.agent_token.clone(),
            timeout: self.agent_timeout,
            max_retries: self.agent_max_retries,
            ..AgentClientConfig::default()
        }
    }
}

/// Control plane configuration: billing settings plus what the lifecycle
/// manager needs to issue and reveal credentials
#[derive(Clone)]
pub struct ControlPlaneConfig {
    pub billing: BillingConfig,
    /// Master secret for credential encryption
    pub encryption_key: String,
    /// Advertised host in connection details
    pub db_host: String,
}

impl ControlPlaneConfig {
    /// Load configuration from environment variables.
    ///
    /// Everything [`BillingConfig::from_env`] reads, plus:
    /// - `ENCRYPTION_KEY` (required)
    /// - `DB_HOST` (`localhost`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            billing: BillingConfig::from_lookup(&lookup)?,
            encryption_key: required(&lookup, "ENCRYPTION_KEY")?,
            db_host: lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut v = ConfigValidator::new();
        self.billing.check(&mut v);
        v.validate_secret("ENCRYPTION_KEY", &self.encryption_key, MIN_ENCRYPTION_KEY_LEN)
            .validate_non_empty("DB_HOST", &self.db_host);
        v.finish()
    }

    /// Lifecycle manager sealing credentials with `ENCRYPTION_KEY` and
    /// advertising `DB_HOST`
    pub fn lifecycle_manager(
        &self,
        store: Arc<dyn Store>,
        agent: Arc<dyn ProvisioningAgent>,
    ) -> InstanceLifecycleManager {
        let codec = Arc::new(CredentialCodec::new(&self.encryption_key));
        InstanceLifecycleManager::new(store, agent, codec, self.db_host.clone())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, message)),
        None => Ok(default),
    }
}
