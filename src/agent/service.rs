//! # Agent Service
//!
//! Validates a request, picks the adapter for its engine and runs the
//! operation. Holds no state besides the adapter registry.

use async_trait::async_trait;
use tracing::{info, warn};

use super::errors::AgentError;
use super::{AgentOperation, AgentRequest, AgentResponse, ProvisioningAgent};
use crate::credentials::{generate_password, DEFAULT_PASSWORD_LENGTH};
use crate::engines::{AdapterRegistry, Engine};

/// Maximum database name length
pub const MAX_DB_NAME_LEN: usize = 64;
/// PostgreSQL truncates identifiers past NAMEDATALEN - 1
pub const MAX_PG_DB_NAME_LEN: usize = 63;
/// Maximum database user length
pub const MAX_DB_USER_LEN: usize = 32;

/// Dispatches agent operations to engine adapters
#[derive(Clone)]
pub struct AgentService {
    registry: AdapterRegistry,
    password_length: usize,
}

impl AgentService {
    /// Create a service with the default password length
    pub fn new(registry: AdapterRegistry) -> Self {
        Self {
            registry,
            password_length: DEFAULT_PASSWORD_LENGTH,
        }
    }

    /// Override the generated password length
    pub fn with_password_length(mut self, password_length: usize) -> Self {
        self.password_length = password_length;
        self
    }

    /// Validate and execute one operation
    pub async fn handle(
        &self,
        operation: AgentOperation,
        request: &AgentRequest,
    ) -> Result<AgentResponse, AgentError> {
        validate_request(request)?;

        let adapter = self.registry.adapter(request.engine);
        let (db_name, db_user) = (request.db_name.as_str(), request.db_user.as_str());

        let result = match operation {
            AgentOperation::Provision => {
                let password = generate_password(self.password_length);
                adapter
                    .create(db_name, db_user, &password)
                    .await
                    .map(|()| AgentResponse::with_password(password))
            }
            AgentOperation::Suspend => adapter
                .suspend(db_name, db_user)
                .await
                .map(|()| AgentResponse::ok()),
            AgentOperation::Resume => adapter
                .resume(db_name, db_user)
                .await
                .map(|()| AgentResponse::ok()),
            AgentOperation::Terminate => adapter
                .terminate(db_name, db_user)
                .await
                .map(|()| AgentResponse::ok()),
            AgentOperation::RotatePassword => {
                let password = generate_password(self.password_length);
                adapter
                    .rotate_password(db_user, &password)
                    .await
                    .map(|()| AgentResponse::with_new_password(password))
            }
        };

        match result {
            Ok(response) => {
                info!(
                    operation = operation.as_str(),
                    engine = %request.engine,
                    db_name,
                    db_user,
                    "agent operation succeeded"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(
                    operation = operation.as_str(),
                    engine = %request.engine,
                    db_name,
                    db_user,
                    kind = ?e.kind,
                    error = %e,
                    "agent operation failed"
                );
                Err(AgentError::Adapter(e))
            }
        }
    }

    async fn respond(
        &self,
        operation: AgentOperation,
        engine: Engine,
        db_name: &str,
        db_user: &str,
    ) -> AgentResponse {
        let request = AgentRequest::new(engine, db_name, db_user);
        self.handle(operation, &request)
            .await
            .unwrap_or_else(|e| AgentResponse::failure(e.to_string()))
    }
}

/// Check identifier bounds and alphabet.
///
/// Identifiers are server-generated (`db_<hex>`, `user_<hex>`); anything
/// outside `[A-Za-z][A-Za-z0-9_]*` is rejected even though adapters also
/// escape what they embed.
pub fn validate_request(request: &AgentRequest) -> Result<(), AgentError> {
    let max_db_name_len = match request.engine {
        Engine::Postgresql => MAX_PG_DB_NAME_LEN,
        Engine::Mysql | Engine::Mongodb => MAX_DB_NAME_LEN,
    };
    validate_identifier("dbName", &request.db_name, max_db_name_len)?;
    validate_identifier("dbUser", &request.db_user, MAX_DB_USER_LEN)?;
    Ok(())
}

fn validate_identifier(field: &str, value: &str, max_len: usize) -> Result<(), AgentError> {
    if value.is_empty() || value.len() > max_len {
        return Err(AgentError::Validation(format!(
            "{} must be 1-{} characters",
            field, max_len
        )));
    }

    if !value.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(AgentError::Validation(format!(
            "{} must start with a letter",
            field
        )));
    }

    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AgentError::Validation(format!(
            "{} may contain only letters, digits and underscores",
            field
        )));
    }

    Ok(())
}

#[async_trait]
impl ProvisioningAgent for AgentService {
    async fn provision(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.respond(AgentOperation::Provision, engine, db_name, db_user)
            .await
    }

    async fn suspend(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.respond(AgentOperation::Suspend, engine, db_name, db_user)
            .await
    }

    async fn resume(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.respond(AgentOperation::Resume, engine, db_name, db_user)
            .await
    }

    async fn terminate(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.respond(AgentOperation::Terminate, engine, db_name, db_user)
            .await
    }

    async fn rotate_password(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.respond(AgentOperation::RotatePassword, engine, db_name, db_user)
            .await
    }
}
