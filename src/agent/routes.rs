//! # Agent Routes
//!
//! `POST /provision | /suspend | /resume | /terminate | /rotate-password`
//! behind the `X-Agent-Token` shared secret, plus an unauthenticated
//! `GET /health` liveness probe.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::errors::AgentError;
use super::service::AgentService;
use super::{AgentOperation, AgentRequest, AgentResponse};

/// Header carrying the shared secret
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";

/// Agent route state
pub struct AgentState {
    service: AgentService,
    token: String,
}

impl AgentState {
    pub fn new(service: AgentService, token: impl Into<String>) -> Self {
        Self {
            service,
            token: token.into(),
        }
    }

    /// Exact, constant-time comparison. An empty configured secret matches nothing.
    fn token_matches(&self, presented: &str) -> bool {
        !self.token.is_empty() && bool::from(self.token.as_bytes().ct_eq(presented.as_bytes()))
    }
}

/// Build agent routes
pub fn agent_routes(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/provision", post(provision))
        .route("/suspend", post(suspend))
        .route("/resume", post(resume))
        .route("/terminate", post(terminate))
        .route("/rotate-password", post(rotate_password))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_agent_token,
        ))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn require_agent_token(
    State(state): State<Arc<AgentState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AGENT_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|token| state.token_matches(token));

    if authorized {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected agent request with bad token");
        failure_response(AgentError::Unauthorized)
    }
}

async fn provision(
    State(state): State<Arc<AgentState>>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    dispatch(&state, AgentOperation::Provision, payload).await
}

async fn suspend(
    State(state): State<Arc<AgentState>>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    dispatch(&state, AgentOperation::Suspend, payload).await
}

async fn resume(
    State(state): State<Arc<AgentState>>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    dispatch(&state, AgentOperation::Resume, payload).await
}

async fn terminate(
    State(state): State<Arc<AgentState>>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    dispatch(&state, AgentOperation::Terminate, payload).await
}

async fn rotate_password(
    State(state): State<Arc<AgentState>>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    dispatch(&state, AgentOperation::RotatePassword, payload).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn dispatch(
    state: &AgentState,
    operation: AgentOperation,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return failure_response(AgentError::Validation(rejection.body_text())),
    };

    match state.service.handle(operation, &request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => failure_response(e),
    }
}

fn failure_response(err: AgentError) -> Response {
    (err.status_code(), Json(AgentResponse::failure(err.to_string()))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::recording_registry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "agent-secret";

    fn app() -> Router {
        let (registry, _) = recording_registry();
        agent_routes(Arc::new(AgentState::new(AgentService::new(registry), TOKEN)))
    }

    fn post_json(path: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(AGENT_TOKEN_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn envelope(response: Response) -> AgentResponse {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const BODY: &str = r#"{"engine":"postgresql","dbName":"db_1a2b3c4d","dbUser":"user_1a2b3c4d"}"#;

    #[tokio::test]
    async fn test_provision_route() {
        let response = app()
            .oneshot(post_json("/provision", Some(TOKEN), BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = envelope(response).await;
        assert!(body.success);
        assert_eq!(body.password.unwrap().len(), 24);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_token() {
        for token in [None, Some("agent-secre"), Some("agent-secret "), Some("")] {
            let response = app()
                .oneshot(post_json("/suspend", token, BODY))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let body = envelope(response).await;
            assert!(!body.success);
            assert_eq!(body.error.as_deref(), Some("Unauthorized"));
        }
    }

    #[tokio::test]
    async fn test_unknown_engine_is_validation_failure() {
        let response = app()
            .oneshot(post_json(
                "/resume",
                Some(TOKEN),
                r#"{"engine":"oracle","dbName":"db_a","dbUser":"user_a"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!envelope(response).await.success);
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"status": "ok"}));
    }

    #[test]
    fn test_empty_configured_token_rejects_everything() {
        let (registry, _) = recording_registry();
        let state = AgentState::new(AgentService::new(registry), "");
        assert!(!state.token_matches(""));
    }
}
