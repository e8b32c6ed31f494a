//! # Provisioning Agent
//!
//! Network-facing dispatcher in front of the engine adapters.
//!
//! ## Components
//!
//! - `service`: validation, password generation, adapter dispatch
//! - `routes`: HTTP surface with shared-secret authentication
//! - `client`: HTTP client used by the control plane
//! - `errors`: agent error taxonomy
//!
//! Every outcome is reported in one envelope,
//! `{success, password?, newPassword?, error?}`. Callers treat every
//! `success: false` the same way.

pub mod client;
pub mod errors;
pub mod routes;
pub mod service;

pub use client::{AgentClient, AgentClientConfig};
pub use errors::AgentError;
pub use routes::{agent_routes, AgentState, AGENT_TOKEN_HEADER};
pub use service::AgentService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engines::Engine;

/// Operations exposed by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOperation {
    Provision,
    Suspend,
    Resume,
    Terminate,
    RotatePassword,
}

impl AgentOperation {
    /// Route path
    pub fn path(&self) -> &'static str {
        match self {
            Self::Provision => "/provision",
            Self::Suspend => "/suspend",
            Self::Resume => "/resume",
            Self::Terminate => "/terminate",
            Self::RotatePassword => "/rotate-password",
        }
    }

    pub fn as_str(&self) -> &'static str {
        &self.path()[1..]
    }
}

/// Request body for every agent operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub engine: Engine,
    pub db_name: String,
    pub db_user: String,
    /// Requested storage in GB; recorded, not enforced by any engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<u32>,
}

impl AgentRequest {
    pub fn new(engine: Engine, db_name: impl Into<String>, db_user: impl Into<String>) -> Self {
        Self {
            engine,
            db_name: db_name.into(),
            db_user: db_user.into(),
            storage_size: None,
        }
    }
}

/// Uniform response envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_password(password: String) -> Self {
        Self {
            success: true,
            password: Some(password),
            ..Default::default()
        }
    }

    pub fn with_new_password(password: String) -> Self {
        Self {
            success: true,
            new_password: Some(password),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Error message, or a generic one when the agent sent none
    pub fn error_message(&self, fallback: &str) -> String {
        self.error.clone().unwrap_or_else(|| fallback.to_string())
    }
}

/// Lifecycle calls the control plane makes against the agent.
///
/// Implemented in-process by [`AgentService`] and over HTTP by
/// [`AgentClient`].
#[async_trait]
pub trait ProvisioningAgent: Send + Sync {
    async fn provision(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse;

    async fn suspend(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse;

    async fn resume(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse;

    async fn terminate(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse;

    async fn rotate_password(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: AgentRequest = serde_json::from_str(
            r#"{"engine":"mysql","dbName":"db_0a1b2c3d","dbUser":"user_0a1b2c3d"}"#,
        )
        .unwrap();
        assert_eq!(request.engine, Engine::Mysql);
        assert_eq!(request.db_name, "db_0a1b2c3d");
        assert_eq!(request.storage_size, None);

        let json = serde_json::to_value(AgentRequest::new(Engine::Mongodb, "db_x", "user_x")).unwrap();
        assert_eq!(json["dbName"], "db_x");
        assert!(json.get("storageSize").is_none());
    }

    #[test]
    fn test_response_envelope() {
        let json = serde_json::to_value(AgentResponse::with_new_password("abc".into())).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "newPassword": "abc"}));

        let json = serde_json::to_value(AgentResponse::failure("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));

        let parsed: AgentResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(parsed, AgentResponse::ok());
    }

    #[test]
    fn test_operation_paths() {
        assert_eq!(AgentOperation::RotatePassword.path(), "/rotate-password");
        assert_eq!(AgentOperation::Provision.as_str(), "provision");
    }
}
