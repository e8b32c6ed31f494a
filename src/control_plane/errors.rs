//! # Control Plane Errors
//!
//! Error types for instance lifecycle, wallet and billing operations.

use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use super::store::StoreError;
use crate::credentials::CodecError;

/// Control plane error types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum ControlPlaneError {
    /// Instance not found
    InstanceNotFound {
        instance_id: String,
    },

    /// Operation not allowed in the instance's current status
    InvalidTransition {
        instance_id: String,
        status: String,
        action: String,
    },

    /// Wallet cannot cover the admission requirement
    InsufficientBalance {
        user_id: String,
        required: Decimal,
        available: Decimal,
    },

    /// Wallet not found (by wallet id or owner)
    WalletNotFound {
        id: String,
    },

    /// Amount violates the sign or range rules of the operation
    InvalidAmount {
        amount: Decimal,
        reason: String,
    },

    /// Agent could not create the database; instance is in `error`
    ProvisioningFailed {
        instance_id: String,
        reason: String,
    },

    /// Agent reported failure for a non-provisioning operation
    AgentFailure {
        instance_id: String,
        operation: String,
        reason: String,
    },

    /// Stored credential failed authentication; rotate to recover
    CredentialUnrecoverable {
        instance_id: String,
    },

    /// Deposit not found
    DepositNotFound {
        deposit_id: String,
    },

    /// Deposit is no longer pending
    DepositAlreadyProcessed {
        deposit_id: String,
    },

    /// Persistence error
    Store {
        message: String,
    },

    /// Credential encryption error
    Crypto {
        message: String,
    },

    /// Internal error
    Internal {
        message: String,
    },
}

impl fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance not found: {}", instance_id)
            }
            Self::InvalidTransition {
                instance_id,
                status,
                action,
            } => {
                write!(f, "Cannot {} instance {} while it is {}", action, instance_id, status)
            }
            Self::InsufficientBalance {
                required, available, ..
            } => {
                write!(
                    f,
                    "Insufficient balance. Minimum balance required to rent per hour: {} (available: {})",
                    required, available
                )
            }
            Self::WalletNotFound { id } => {
                write!(f, "Wallet not found: {}", id)
            }
            Self::InvalidAmount { amount, reason } => {
                write!(f, "Invalid amount {}: {}", amount, reason)
            }
            Self::ProvisioningFailed { instance_id, reason } => {
                write!(f, "Provisioning failed for {}: {}", instance_id, reason)
            }
            Self::AgentFailure {
                instance_id,
                operation,
                reason,
            } => {
                write!(f, "Agent {} failed for {}: {}", operation, instance_id, reason)
            }
            Self::CredentialUnrecoverable { instance_id } => {
                write!(
                    f,
                    "Stored credential for {} cannot be decrypted; rotate the password",
                    instance_id
                )
            }
            Self::DepositNotFound { deposit_id } => {
                write!(f, "Deposit not found: {}", deposit_id)
            }
            Self::DepositAlreadyProcessed { deposit_id } => {
                write!(f, "Deposit already processed: {}", deposit_id)
            }
            Self::Store { message } => {
                write!(f, "Store error: {}", message)
            }
            Self::Crypto { message } => {
                write!(f, "Credential error: {}", message)
            }
            Self::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for ControlPlaneError {}

/// Result type for control plane operations
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

impl ControlPlaneError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InstanceNotFound { .. } => 404,
            Self::InvalidTransition { .. } => 409,
            Self::InsufficientBalance { .. } => 402,
            Self::WalletNotFound { .. } => 404,
            Self::InvalidAmount { .. } => 400,
            Self::ProvisioningFailed { .. } => 500,
            Self::AgentFailure { .. } => 502,
            Self::CredentialUnrecoverable { .. } => 500,
            Self::DepositNotFound { .. } => 404,
            Self::DepositAlreadyProcessed { .. } => 400,
            Self::Store { .. } => 500,
            Self::Crypto { .. } => 500,
            Self::Internal { .. } => 500,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::WalletNotFound { .. } => "WALLET_NOT_FOUND",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::ProvisioningFailed { .. } => "PROVISIONING_FAILED",
            Self::AgentFailure { .. } => "AGENT_FAILURE",
            Self::CredentialUnrecoverable { .. } => "CREDENTIAL_UNRECOVERABLE",
            Self::DepositNotFound { .. } => "DEPOSIT_NOT_FOUND",
            Self::DepositAlreadyProcessed { .. } => "DEPOSIT_ALREADY_PROCESSED",
            Self::Store { .. } => "STORE_ERROR",
            Self::Crypto { .. } => "CRYPTO_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Map a store error from a deposit operation
    pub fn from_deposit(deposit_id: Uuid, err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => Self::DepositAlreadyProcessed {
                deposit_id: deposit_id.to_string(),
            },
            other => other.into(),
        }
    }
}

impl From<StoreError> for ControlPlaneError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                entity: "instance",
                id,
            } => Self::InstanceNotFound { instance_id: id },
            StoreError::NotFound {
                entity: "wallet",
                id,
            } => Self::WalletNotFound { id },
            StoreError::NotFound {
                entity: "deposit",
                id,
            } => Self::DepositNotFound { deposit_id: id },
            other => Self::Store {
                message: other.to_string(),
            },
        }
    }
}

impl From<CodecError> for ControlPlaneError {
    fn from(err: CodecError) -> Self {
        Self::Crypto {
            message: err.to_string(),
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<ControlPlaneError> for ErrorResponse {
    fn from(err: ControlPlaneError) -> Self {
        Self {
            error: err.to_string(),
            code: err.error_code(),
            status: err.status_code(),
            details: serde_json::to_value(&err).ok(),
        }
    }
}
