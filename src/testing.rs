//! Test doubles shared by unit tests across modules.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agent::{AgentOperation, AgentResponse, ProvisioningAgent};
use crate::engines::{AdapterError, AdapterRegistry, AdapterResult, Engine, EngineAdapter};

/// One call observed by a [`RecordingAdapter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Create {
        db_name: String,
        db_user: String,
        password: String,
    },
    Suspend {
        db_name: String,
        db_user: String,
    },
    Resume {
        db_name: String,
        db_user: String,
    },
    Terminate {
        db_name: String,
        db_user: String,
    },
    RotatePassword {
        db_user: String,
        password: String,
    },
}

/// Adapter that records every call and optionally fails all of them
pub struct RecordingAdapter {
    engine: Engine,
    calls: Mutex<Vec<AdapterCall>>,
    failure: Mutex<Option<String>>,
}

impl RecordingAdapter {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: AdapterCall) -> AdapterResult<()> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(AdapterError::permanent(message));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl EngineAdapter for RecordingAdapter {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn create(&self, db_name: &str, db_user: &str, password: &str) -> AdapterResult<()> {
        self.record(AdapterCall::Create {
            db_name: db_name.into(),
            db_user: db_user.into(),
            password: password.into(),
        })
    }

    async fn suspend(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.record(AdapterCall::Suspend {
            db_name: db_name.into(),
            db_user: db_user.into(),
        })
    }

    async fn resume(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.record(AdapterCall::Resume {
            db_name: db_name.into(),
            db_user: db_user.into(),
        })
    }

    async fn terminate(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.record(AdapterCall::Terminate {
            db_name: db_name.into(),
            db_user: db_user.into(),
        })
    }

    async fn rotate_password(&self, db_user: &str, new_password: &str) -> AdapterResult<()> {
        self.record(AdapterCall::RotatePassword {
            db_user: db_user.into(),
            password: new_password.into(),
        })
    }
}

/// Handles to the adapters inside a registry built by [`recording_registry`]
pub struct RecordingAdapters {
    pub postgresql: Arc<RecordingAdapter>,
    pub mysql: Arc<RecordingAdapter>,
    pub mongodb: Arc<RecordingAdapter>,
}

impl RecordingAdapters {
    pub fn get(&self, engine: Engine) -> &RecordingAdapter {
        match engine {
            Engine::Postgresql => &self.postgresql,
            Engine::Mysql => &self.mysql,
            Engine::Mongodb => &self.mongodb,
        }
    }
}

pub fn recording_registry() -> (AdapterRegistry, RecordingAdapters) {
    let adapters = RecordingAdapters {
        postgresql: Arc::new(RecordingAdapter::new(Engine::Postgresql)),
        mysql: Arc::new(RecordingAdapter::new(Engine::Mysql)),
        mongodb: Arc::new(RecordingAdapter::new(Engine::Mongodb)),
    };
    let registry = AdapterRegistry::new(
        adapters.postgresql.clone(),
        adapters.mysql.clone(),
        adapters.mongodb.clone(),
    );
    (registry, adapters)
}

/// One call observed by a [`RecordingAgent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub operation: AgentOperation,
    pub engine: Engine,
    pub db_name: String,
    pub db_user: String,
}

/// Runs after the agent has handled an operation
pub type AgentHook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Agent double: records calls, hands out fixed passwords and can be told
/// to fail specific operations.
#[derive(Default)]
pub struct RecordingAgent {
    calls: Mutex<Vec<AgentCall>>,
    failing: Mutex<Vec<AgentOperation>>,
    hooks: Mutex<Vec<(AgentOperation, AgentHook)>>,
}

impl RecordingAgent {
    pub const PASSWORD: &'static str = "Pw0rdPw0rdPw0rdPw0rdPw0r";
    pub const ROTATED_PASSWORD: &'static str = "R0tatedR0tatedR0tatedR0t";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, operation: AgentOperation) {
        self.failing.lock().unwrap().push(operation);
    }

    /// Run `hook` after every `operation`, before the response is returned
    pub fn after<F, Fut>(&self, operation: AgentOperation, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: AgentHook = Box::new(move || Box::pin(hook()));
        self.hooks.lock().unwrap().push((operation, hook));
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: AgentOperation) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    async fn handle(
        &self,
        operation: AgentOperation,
        engine: Engine,
        db_name: &str,
        db_user: &str,
    ) -> AgentResponse {
        let response = self.record(operation, engine, db_name, db_user);
        let pending: Vec<_> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, hook)| hook())
            .collect();
        for hook in pending {
            hook.await;
        }
        response
    }

    fn record(
        &self,
        operation: AgentOperation,
        engine: Engine,
        db_name: &str,
        db_user: &str,
    ) -> AgentResponse {
        self.calls.lock().unwrap().push(AgentCall {
            operation,
            engine,
            db_name: db_name.into(),
            db_user: db_user.into(),
        });

        if self.failing.lock().unwrap().contains(&operation) {
            return AgentResponse::failure(format!("{} failed", operation.as_str()));
        }

        match operation {
            AgentOperation::Provision => AgentResponse::with_password(Self::PASSWORD.into()),
            AgentOperation::RotatePassword => {
                AgentResponse::with_new_password(Self::ROTATED_PASSWORD.into())
            }
            _ => AgentResponse::ok(),
        }
    }
}

#[async_trait]
impl ProvisioningAgent for RecordingAgent {
    async fn provision(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.handle(AgentOperation::Provision, engine, db_name, db_user).await
    }

    async fn suspend(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.handle(AgentOperation::Suspend, engine, db_name, db_user).await
    }

    async fn resume(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.handle(AgentOperation::Resume, engine, db_name, db_user).await
    }

    async fn terminate(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.handle(AgentOperation::Terminate, engine, db_name, db_user).await
    }

    async fn rotate_password(&self, engine: Engine, db_name: &str, db_user: &str) -> AgentResponse {
        self.handle(AgentOperation::RotatePassword, engine, db_name, db_user).await
    }
}
