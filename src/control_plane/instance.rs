//! # Instance Model
//!
//! Managed database instances and their state machine.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engines::Engine;

/// Instance status
///
/// ```text
/// provisioning -> running | error
/// running <-> suspended
/// running | suspended -> terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Agent has been asked to create the database
    Provisioning,
    /// Serving and billed
    Running,
    /// Access revoked, data kept, not billed
    Suspended,
    /// Dropped (terminal)
    Terminated,
    /// Provisioning failed (terminal)
    Error,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Provisioning
    }
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }

    /// Whether `next` is reachable in one step
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Provisioning, Running)
                | (Provisioning, Error)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Terminated)
                | (Suspended, Terminated)
        )
    }

    /// No transitions leave this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "terminated" => Ok(Self::Terminated),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// Managed database instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: Uuid,
    /// Opaque id from the identity layer
    pub user_id: String,
    pub product_id: String,
    pub engine: Engine,
    pub status: InstanceStatus,
    /// Server-generated, `db_<8 hex>`
    pub db_name: String,
    /// Server-generated, `user_<8 hex>`
    pub db_user: String,
    /// Output of the credential codec; empty until provisioning succeeds
    #[serde(skip_serializing, default)]
    pub encrypted_password: String,
    pub host: String,
    pub port: u16,
    pub rate_per_hour: Decimal,
    /// Requested storage in GB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<u32>,
    /// Start of the next billing window. Set when the instance first
    /// becomes running and only moved by committed usage records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_billed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// New instance in `provisioning` with fresh identifiers
    pub fn new(request: &CreateInstanceRequest, host: impl Into<String>) -> Self {
        let (db_name, db_user) = generate_identifiers();

        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            product_id: request.product_id.clone(),
            engine: request.engine,
            status: InstanceStatus::Provisioning,
            db_name,
            db_user,
            encrypted_password: String::new(),
            host: host.into(),
            port: request.engine.default_port(),
            rate_per_hour: request.rate_per_hour,
            storage_size: request.storage_size,
            last_billed_at: None,
            created_at: Utc::now(),
            terminated_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Create instance request, as handed over by the CRUD layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub user_id: String,
    pub product_id: String,
    /// From the catalog
    pub engine: Engine,
    /// From the catalog
    pub rate_per_hour: Decimal,
    #[serde(default)]
    pub storage_size: Option<u32>,
}

/// Connection details returned once, right after provisioning
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCredentials {
    pub id: Uuid,
    pub engine: Engine,
    pub status: InstanceStatus,
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub db_user: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

impl InstanceCredentials {
    pub fn new(instance: &Instance, password: String) -> Self {
        Self {
            id: instance.id,
            engine: instance.engine,
            status: instance.status,
            host: instance.host.clone(),
            port: instance.port,
            db_name: instance.db_name.clone(),
            db_user: instance.db_user.clone(),
            password,
            created_at: instance.created_at,
        }
    }
}

/// Fresh `(db_<8 hex>, user_<8 hex>)` pair from 4 random bytes each
pub fn generate_identifiers() -> (String, String) {
    let mut rng = rand::rngs::OsRng;
    let mut name = [0u8; 4];
    let mut user = [0u8; 4];
    rng.fill_bytes(&mut name);
    rng.fill_bytes(&mut user);
    (
        format!("db_{}", hex::encode(name)),
        format!("user_{}", hex::encode(user)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            user_id: "user-1".to_string(),
            product_id: "pg-small".to_string(),
            engine: Engine::Postgresql,
            rate_per_hour: Decimal::new(75, 1),
            storage_size: Some(1),
        }
    }

    #[test]
    fn test_new_instance() {
        let instance = Instance::new(&request(), "db.example.com");
        assert_eq!(instance.status, InstanceStatus::Provisioning);
        assert_eq!(instance.port, 5433);
        assert_eq!(instance.host, "db.example.com");
        assert!(instance.encrypted_password.is_empty());
        assert!(instance.last_billed_at.is_none());
    }

    #[test]
    fn test_identifier_format() {
        let (db_name, db_user) = generate_identifiers();
        assert_eq!(db_name.len(), 11);
        assert_eq!(db_user.len(), 13);
        assert!(db_name.starts_with("db_"));
        assert!(db_user.starts_with("user_"));
        assert!(db_name[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(db_user[5..].chars().all(|c| c.is_ascii_hexdigit()));

        let (other, _) = generate_identifiers();
        assert_ne!(db_name, other);
    }

    #[test]
    fn test_state_machine() {
        use InstanceStatus::*;

        assert!(Provisioning.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Error));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Running.can_transition_to(Terminated));
        assert!(Suspended.can_transition_to(Terminated));

        assert!(!Provisioning.can_transition_to(Suspended));
        assert!(!Error.can_transition_to(Running));
        for next in [Provisioning, Running, Suspended, Error] {
            assert!(!Terminated.can_transition_to(next));
        }
        assert!(Terminated.is_terminal() && Error.is_terminal());
    }

    #[test]
    fn test_password_never_serialized() {
        let mut instance = Instance::new(&request(), "localhost");
        instance.encrypted_password = "c2VjcmV0".to_string();
        let json = serde_json::to_value(&instance).unwrap();
        assert!(json.get("encryptedPassword").is_none());
        assert_eq!(json["status"], "provisioning");
        assert_eq!(json["ratePerHour"], "7.5");
    }
}
