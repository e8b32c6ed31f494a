//! # Instance Lifecycle
//!
//! Drives instances through their state machine, calling the agent and
//! persisting the outcome.
//!
//! ```text
//! provisioning ──ok──▶ running ◀──resume── suspended
//!      │                  │ └────suspend────▶ │
//!      └──fail──▶ error   └───▶ terminated ◀──┘
//! ```
//!
//! Every operation is scoped to the owning user; instances of other users
//! are reported as not found.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::billing::settlement_charge;
use super::errors::{ControlPlaneError, ControlPlaneResult};
use super::instance::{CreateInstanceRequest, Instance, InstanceCredentials, InstanceStatus};
use super::store::{InstanceTransition, Store, StoreError, UsageCharge};
use crate::agent::{AgentOperation, AgentResponse, ProvisioningAgent};
use crate::credentials::{CodecError, CredentialCodec};

const TERMINATE_ATTEMPTS: usize = 3;

/// Instance lifecycle orchestrator
#[derive(Clone)]
pub struct InstanceLifecycleManager {
    store: Arc<dyn Store>,
    agent: Arc<dyn ProvisioningAgent>,
    codec: Arc<CredentialCodec>,
    /// Advertised host for connection details
    host: String,
}

impl InstanceLifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<dyn ProvisioningAgent>,
        codec: Arc<CredentialCodec>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent,
            codec,
            host: host.into(),
        }
    }

    /// Admit, provision and start billing a new instance
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> ControlPlaneResult<InstanceCredentials> {
        if request.rate_per_hour < Decimal::ZERO {
            return Err(ControlPlaneError::InvalidAmount {
                amount: request.rate_per_hour,
                reason: "rate per hour cannot be negative".to_string(),
            });
        }
        self.check_admission(&request.user_id, request.rate_per_hour)
            .await?;

        let instance = Instance::new(&request, self.host.clone());
        self.store.insert_instance(&instance).await?;
        info!(
            instance_id = %instance.id,
            user_id = %instance.user_id,
            engine = %instance.engine,
            db_name = %instance.db_name,
            "provisioning instance"
        );

        let response = self
            .agent
            .provision(instance.engine, &instance.db_name, &instance.db_user)
            .await;

        let password = match response {
            AgentResponse {
                success: true,
                password: Some(password),
                ..
            } => password,
            other => {
                let reason = other.error_message("Provisioning failed");
                error!(instance_id = %instance.id, %reason, "provisioning failed");
                self.mark_error(&instance).await;
                return Err(ControlPlaneError::ProvisioningFailed {
                    instance_id: instance.id.to_string(),
                    reason,
                });
            }
        };

        let ciphertext = match self.encrypt(password.clone()).await {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "could not encrypt credential");
                self.mark_error(&instance).await;
                return Err(e);
            }
        };

        let transition = InstanceTransition {
            encrypted_password: Some(ciphertext),
            billing_start: Some(Utc::now()),
            ..InstanceTransition::new(InstanceStatus::Provisioning, InstanceStatus::Running)
        };
        let running = self.apply(&instance, transition, "activate").await?;

        info!(instance_id = %running.id, "instance running");
        Ok(InstanceCredentials::new(&running, password))
    }

    /// Settle the open window and stop the instance
    pub async fn suspend(&self, user_id: &str, instance_id: Uuid) -> ControlPlaneResult<Instance> {
        let instance = self.owned(user_id, instance_id).await?;
        require(&instance, &[InstanceStatus::Running], "suspend")?;

        self.settle(&instance, Utc::now()).await?;
        self.call_agent(&instance, AgentOperation::Suspend).await?;

        let suspended = self
            .apply(
                &instance,
                InstanceTransition::new(InstanceStatus::Running, InstanceStatus::Suspended),
                "suspend",
            )
            .await?;
        info!(instance_id = %instance_id, "instance suspended");
        Ok(suspended)
    }

    /// Restart a suspended instance; suspended time is closed uncharged.
    ///
    /// The suspended window is closed before the engine is touched. If the
    /// status change fails after the engine has resumed, the engine is
    /// suspended again.
    pub async fn resume(&self, user_id: &str, instance_id: Uuid) -> ControlPlaneResult<Instance> {
        let instance = self.owned(user_id, instance_id).await?;
        require(&instance, &[InstanceStatus::Suspended], "resume")?;
        self.check_admission(user_id, instance.rate_per_hour).await?;

        self.close_suspended_window(&instance, Utc::now()).await?;
        self.call_agent(&instance, AgentOperation::Resume).await?;

        let transition = InstanceTransition::new(InstanceStatus::Suspended, InstanceStatus::Running);
        match self.apply(&instance, transition, "resume").await {
            Ok(running) => {
                info!(instance_id = %instance_id, "instance resumed");
                Ok(running)
            }
            Err(e) => {
                self.undo_resume(&instance).await;
                Err(e)
            }
        }
    }

    /// Settle if running, drop the database and user, and mark terminated
    pub async fn terminate(&self, user_id: &str, instance_id: Uuid) -> ControlPlaneResult<Instance> {
        let instance = self.owned(user_id, instance_id).await?;
        require(
            &instance,
            &[InstanceStatus::Running, InstanceStatus::Suspended],
            "terminate",
        )?;

        let now = Utc::now();
        if instance.is_running() {
            self.settle(&instance, now).await?;
        }

        self.call_agent(&instance, AgentOperation::Terminate).await?;

        let terminated = self.mark_terminated(&instance, now).await?;
        info!(instance_id = %instance_id, "instance terminated");
        Ok(terminated)
    }

    /// Issue a new password and return it once
    pub async fn rotate_password(
        &self,
        user_id: &str,
        instance_id: Uuid,
    ) -> ControlPlaneResult<InstanceCredentials> {
        let instance = self.owned(user_id, instance_id).await?;
        require(
            &instance,
            &[InstanceStatus::Running, InstanceStatus::Suspended],
            "rotate the password of",
        )?;

        let response = self
            .call_agent(&instance, AgentOperation::RotatePassword)
            .await?;
        let password = response
            .new_password
            .ok_or_else(|| ControlPlaneError::AgentFailure {
                instance_id: instance_id.to_string(),
                operation: "rotate-password".to_string(),
                reason: "agent returned no password".to_string(),
            })?;

        let ciphertext = self.encrypt(password.clone()).await?;
        self.store
            .set_encrypted_password(instance_id, &ciphertext)
            .await?;

        info!(instance_id = %instance_id, "password rotated");
        Ok(InstanceCredentials::new(&instance, password))
    }

    /// Decrypt the stored credential for the owner
    pub async fn reveal_credentials(
        &self,
        user_id: &str,
        instance_id: Uuid,
    ) -> ControlPlaneResult<InstanceCredentials> {
        let instance = self.owned(user_id, instance_id).await?;
        require(
            &instance,
            &[
                InstanceStatus::Running,
                InstanceStatus::Suspended,
                InstanceStatus::Terminated,
            ],
            "reveal credentials of",
        )?;

        let codec = self.codec.clone();
        let ciphertext = instance.encrypted_password.clone();
        let decrypted = tokio::task::spawn_blocking(move || codec.decrypt(&ciphertext))
            .await
            .map_err(|e| ControlPlaneError::Internal {
                message: e.to_string(),
            })?;

        match decrypted {
            Ok(password) => Ok(InstanceCredentials::new(&instance, password)),
            Err(CodecError::Authentication) | Err(CodecError::Malformed(_)) => {
                warn!(instance_id = %instance_id, "stored credential cannot be decrypted");
                Err(ControlPlaneError::CredentialUnrecoverable {
                    instance_id: instance_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn instance(&self, user_id: &str, instance_id: Uuid) -> ControlPlaneResult<Instance> {
        self.owned(user_id, instance_id).await
    }

    /// Newest first
    pub async fn instances(&self, user_id: &str) -> ControlPlaneResult<Vec<Instance>> {
        Ok(self.store.instances_for_user(user_id).await?)
    }

    async fn owned(&self, user_id: &str, instance_id: Uuid) -> ControlPlaneResult<Instance> {
        match self.store.instance(instance_id).await? {
            Some(instance) if instance.user_id == user_id => Ok(instance),
            _ => Err(ControlPlaneError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    /// Wallet must hold at least one hour at `rate`
    async fn check_admission(&self, user_id: &str, rate: Decimal) -> ControlPlaneResult<()> {
        let available = match self.store.wallet_for_user(user_id).await? {
            Some(wallet) => wallet.balance,
            None => {
                return Err(ControlPlaneError::WalletNotFound {
                    id: user_id.to_string(),
                })
            }
        };
        if available < rate {
            return Err(ControlPlaneError::InsufficientBalance {
                user_id: user_id.to_string(),
                required: rate,
                available,
            });
        }
        Ok(())
    }

    /// Bill the open window of a running instance up to `now`
    async fn settle(&self, instance: &Instance, now: DateTime<Utc>) -> ControlPlaneResult<()> {
        let Some(wallet) = self.store.wallet_for_user(&instance.user_id).await? else {
            warn!(instance_id = %instance.id, "no wallet for owner, window left unbilled");
            return Ok(());
        };
        let Some(charge) = settlement_charge(instance, Some(wallet.id), now) else {
            return Ok(());
        };

        match self.store.record_usage(&charge).await {
            Ok(outcome) => {
                info!(
                    instance_id = %instance.id,
                    amount = %outcome.record.amount,
                    "final window charged"
                );
                Ok(())
            }
            Err(StoreError::DuplicateWindow { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close_suspended_window(
        &self,
        instance: &Instance,
        now: DateTime<Utc>,
    ) -> ControlPlaneResult<()> {
        let Some(start) = instance.last_billed_at else {
            return Ok(());
        };
        if now <= start {
            return Ok(());
        }

        let charge = UsageCharge {
            instance_id: instance.id,
            wallet_id: None,
            db_name: instance.db_name.clone(),
            start,
            end: now,
            rate_per_hour: Decimal::ZERO,
            amount: Decimal::ZERO,
        };
        match self.store.record_usage(&charge).await {
            Ok(_) | Err(StoreError::DuplicateWindow { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn call_agent(
        &self,
        instance: &Instance,
        operation: AgentOperation,
    ) -> ControlPlaneResult<AgentResponse> {
        let (engine, db_name, db_user) = (instance.engine, &instance.db_name, &instance.db_user);
        let response = match operation {
            AgentOperation::Provision => self.agent.provision(engine, db_name, db_user).await,
            AgentOperation::Suspend => self.agent.suspend(engine, db_name, db_user).await,
            AgentOperation::Resume => self.agent.resume(engine, db_name, db_user).await,
            AgentOperation::Terminate => self.agent.terminate(engine, db_name, db_user).await,
            AgentOperation::RotatePassword => {
                self.agent.rotate_password(engine, db_name, db_user).await
            }
        };
        if response.success {
            return Ok(response);
        }

        let reason = response.error_message(&format!("{} failed", operation.as_str()));
        error!(instance_id = %instance.id, operation = operation.as_str(), %reason, "agent call failed");
        Err(ControlPlaneError::AgentFailure {
            instance_id: instance.id.to_string(),
            operation: operation.as_str().to_string(),
            reason,
        })
    }

    async fn apply(
        &self,
        instance: &Instance,
        transition: InstanceTransition,
        action: &str,
    ) -> ControlPlaneResult<Instance> {
        match self.store.transition_instance(instance.id, transition).await {
            Ok(updated) => Ok(updated),
            Err(StoreError::Conflict(_)) => {
                let current = self
                    .store
                    .instance(instance.id)
                    .await?
                    .map(|i| i.status)
                    .unwrap_or(instance.status);
                Err(invalid_transition(instance.id, current, action))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Called after the engine objects are dropped. Retries from whatever
    /// non-terminal status a concurrent billing pass left behind.
    async fn mark_terminated(
        &self,
        instance: &Instance,
        now: DateTime<Utc>,
    ) -> ControlPlaneResult<Instance> {
        let mut from = instance.status;
        for _ in 0..TERMINATE_ATTEMPTS {
            let transition = InstanceTransition {
                terminated_at: Some(now),
                ..InstanceTransition::new(from, InstanceStatus::Terminated)
            };
            match self.store.transition_instance(instance.id, transition).await {
                Ok(terminated) => return Ok(terminated),
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let current = self.store.instance(instance.id).await?.ok_or_else(|| {
                ControlPlaneError::InstanceNotFound {
                    instance_id: instance.id.to_string(),
                }
            })?;
            match current.status {
                InstanceStatus::Terminated => return Ok(current),
                InstanceStatus::Running | InstanceStatus::Suspended => {
                    warn!(
                        instance_id = %instance.id,
                        expected = %from,
                        found = %current.status,
                        "status changed during terminate, retrying"
                    );
                    from = current.status;
                }
                other => return Err(invalid_transition(instance.id, other, "terminate")),
            }
        }
        Err(invalid_transition(instance.id, from, "terminate"))
    }

    async fn undo_resume(&self, instance: &Instance) {
        match self.store.instance(instance.id).await {
            Ok(Some(current)) if current.status == InstanceStatus::Running => return,
            Ok(_) => {}
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "could not re-read instance after failed resume")
            }
        }
        match self.call_agent(instance, AgentOperation::Suspend).await {
            Ok(_) => warn!(instance_id = %instance.id, "engine suspended again after failed resume"),
            Err(e) => error!(
                instance_id = %instance.id,
                error = %e,
                "engine left resumed while instance is recorded as suspended"
            ),
        }
    }

    async fn mark_error(&self, instance: &Instance) {
        let transition = InstanceTransition::new(InstanceStatus::Provisioning, InstanceStatus::Error);
        if let Err(e) = self.store.transition_instance(instance.id, transition).await {
            error!(instance_id = %instance.id, error = %e, "could not mark instance as error");
        }
    }

    async fn encrypt(&self, password: String) -> ControlPlaneResult<String> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || codec.encrypt(&password))
            .await
            .map_err(|e| ControlPlaneError::Internal {
                message: e.to_string(),
            })?
            .map_err(Into::into)
    }
}

fn require(instance: &Instance, allowed: &[InstanceStatus], action: &str) -> ControlPlaneResult<()> {
    if allowed.contains(&instance.status) {
        Ok(())
    } else {
        Err(invalid_transition(instance.id, instance.status, action))
    }
}

fn invalid_transition(instance_id: Uuid, status: InstanceStatus, action: &str) -> ControlPlaneError {
    ControlPlaneError::InvalidTransition {
        instance_id: instance_id.to_string(),
        status: status.to_string(),
        action: action.to_string(),
    }
}
