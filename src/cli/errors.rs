//! CLI errors

use crate::agent::AgentError;
use crate::config::ConfigError;
use crate::config_validator::{format_validation_errors, ConfigValidationError};
use crate::control_plane::{ControlPlaneError, StoreError};
use crate::engines::AdapterError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid configuration:\n{}", format_validation_errors(.0))]
    Validation(Vec<ConfigValidationError>),

    #[error("engine adapters: {0}")]
    Adapter(#[from] AdapterError),

    #[error("agent client: {0}")]
    Agent(#[from] AgentError),

    #[error("control plane store: {0}")]
    Store(#[from] StoreError),

    #[error("billing: {0}")]
    Billing(#[from] ControlPlaneError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Vec<ConfigValidationError>> for CliError {
    fn from(errors: Vec<ConfigValidationError>) -> Self {
        Self::Validation(errors)
    }
}

pub type CliResult<T> = Result<T, CliError>;
