//! # Agent Client
//!
//! HTTP client the control plane uses to reach the provisioning agent.
//! Every failure, transport included, comes back as a `success: false`
//! envelope so callers handle exactly one failure shape.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::errors::AgentError;
use super::routes::AGENT_TOKEN_HEADER;
use super::{AgentOperation, AgentRequest, AgentResponse, ProvisioningAgent};
use crate::engines::Engine;

/// Agent client configuration
#[derive(Clone)]
pub struct AgentClientConfig {
    /// Base URL, e.g. `http://localhost:4001`
    pub base_url: String,
    /// Shared secret sent as `X-Agent-Token`
    pub token: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Extra attempts after a connection failure
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub retry_backoff: Duration,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4001".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// HTTP implementation of [`ProvisioningAgent`]
pub struct AgentClient {
    http: reqwest::Client,
    config: AgentClientConfig,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(config: AgentClientConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn url(&self, operation: AgentOperation) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            operation.path()
        )
    }

    /// Send one operation.
    ///
    /// Only connection failures are retried: the request never reached the
    /// agent. A timeout is not retried because the agent may still be
    /// executing it, and a retried provision would mint a second password.
    pub async fn call(
        &self,
        operation: AgentOperation,
        request: &AgentRequest,
    ) -> Result<AgentResponse, AgentError> {
        let url = self.url(operation);
        let mut attempt = 0;

        loop {
            let result = self
                .http
                .post(&url)
                .header(AGENT_TOKEN_HEADER, &self.config.token)
                .json(request)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    debug!(operation = operation.as_str(), %status, "agent responded");
                    return response.json::<AgentResponse>().await.map_err(|e| {
                        AgentError::Transport(format!("invalid agent response ({}): {}", status, e))
                    });
                }
                Err(e) if e.is_connect() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        operation = operation.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "agent unreachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(AgentError::Transport(e.to_string())),
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
        self.call(operation, &request)
            .await
            .unwrap_or_else(|e| AgentResponse::failure(e.to_string()))
    }
}

#[async_trait]
impl ProvisioningAgent for AgentClient {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::routes::{agent_routes, AgentState};
    use crate::agent::service::AgentService;
    use crate::testing::{recording_registry, AdapterCall};
    use std::net::SocketAddr;
    use std::sync::Arc;

    async fn spawn_agent(token: &str) -> (SocketAddr, crate::testing::RecordingAdapters) {
        let (registry, adapters) = recording_registry();
        let app = agent_routes(Arc::new(AgentState::new(AgentService::new(registry), token)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, adapters)
    }

    fn client(base_url: String, token: &str) -> AgentClient {
        AgentClient::new(AgentClientConfig {
            base_url,
            token: token.to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 1,
            retry_backoff: Duration::from_millis(10),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_against_agent() {
        let (addr, adapters) = spawn_agent("s3cret").await;
        let client = client(format!("http://{}/", addr), "s3cret");

        let response = client.provision(Engine::Mysql, "db_1", "user_1").await;
        assert!(response.success);
        let password = response.password.unwrap();

        let response = client.suspend(Engine::Mysql, "db_1", "user_1").await;
        assert!(response.success);

        assert_eq!(
            adapters.mysql.calls(),
            vec![
                AdapterCall::Create {
                    db_name: "db_1".into(),
                    db_user: "user_1".into(),
                    password,
                },
                AdapterCall::Suspend {
                    db_name: "db_1".into(),
                    db_user: "user_1".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_token_is_failure_envelope() {
        let (addr, adapters) = spawn_agent("s3cret").await;
        let client = client(format!("http://{}", addr), "nope");

        let response = client.terminate(Engine::Postgresql, "db_1", "user_1").await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Unauthorized"));
        assert!(adapters.postgresql.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_failure_envelope() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(format!("http://{}", addr), "s3cret");
        let response = client.resume(Engine::Mongodb, "db_1", "user_1").await;
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Agent unavailable"));
    }

    #[test]
    fn test_url_joining() {
        let client = client("http://agent:4001/".to_string(), "t");
        assert_eq!(
            client.url(AgentOperation::RotatePassword),
            "http://agent:4001/rotate-password"
        );
    }
}
