//! # Billing Engine
//!
//! Periodic metering of running instances.
//!
//! Per pass, for each running instance:
//!
//! 1. Windows shorter than [`MIN_BILLABLE_SECONDS`] are left for the next pass.
//! 2. A window already recorded for `(instance, last_billed_at)` is skipped.
//! 3. Usage record, wallet debit, ledger entry and the `last_billed_at`
//!    advance commit together through [`Store::record_usage`].
//! 4. The wallet balance is re-read; a negative balance suspends the
//!    instance. This runs every pass whether or not step 3 did, so a
//!    suspension missed after a crash happens on the next pass.
//!
//! Only one pass runs at a time: an in-process mutex plus the store's
//! cross-process lock. Overlapping triggers are skipped.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::errors::{ControlPlaneError, ControlPlaneResult};
use super::instance::{Instance, InstanceStatus};
use super::store::{InstanceTransition, Store, StoreError, UsageCharge};
use crate::agent::ProvisioningAgent;

/// Windows shorter than this are not billed yet
pub const MIN_BILLABLE_SECONDS: i64 = 60;

/// Decimal places kept on computed charges
pub const AMOUNT_SCALE: u32 = 6;

const SECONDS_PER_HOUR: i64 = 3600;

/// Charge for `[last_billed_at, now)`, or `None` when there is nothing to bill yet.
///
/// The window is cut at whole elapsed seconds so the remainder carries
/// into the next window and windows stay contiguous.
pub fn window_charge(
    instance: &Instance,
    wallet_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Option<UsageCharge> {
    charge_from_anchor(instance, wallet_id, now, MIN_BILLABLE_SECONDS)
}

/// Final charge when an instance stops running: any whole second counts.
pub fn settlement_charge(
    instance: &Instance,
    wallet_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Option<UsageCharge> {
    charge_from_anchor(instance, wallet_id, now, 1)
}

fn charge_from_anchor(
    instance: &Instance,
    wallet_id: Option<Uuid>,
    now: DateTime<Utc>,
    min_seconds: i64,
) -> Option<UsageCharge> {
    let start = instance.last_billed_at?;
    let elapsed = (now - start).num_seconds();
    if elapsed < min_seconds {
        return None;
    }

    let amount = (Decimal::from(elapsed) * instance.rate_per_hour
        / Decimal::from(SECONDS_PER_HOUR))
    .round_dp(AMOUNT_SCALE);

    Some(UsageCharge {
        instance_id: instance.id,
        wallet_id,
        db_name: instance.db_name.clone(),
        start,
        end: start + Duration::seconds(elapsed),
        rate_per_hour: instance.rate_per_hour,
        amount,
    })
}

/// Summary of one billing pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    /// Running instances examined
    pub scanned: usize,
    /// Windows committed
    pub charged: usize,
    /// Instances with nothing to bill this pass
    pub skipped: usize,
    /// Instances suspended for a negative balance
    pub suspended: usize,
    /// Instances whose processing failed; retried next pass
    pub failed: usize,
    /// Sum of committed charges
    pub total_charged: Decimal,
}

/// Meters running instances and suspends insolvent ones
pub struct BillingEngine {
    store: Arc<dyn Store>,
    agent: Arc<dyn ProvisioningAgent>,
    pass_lock: Mutex<()>,
}

impl BillingEngine {
    pub fn new(store: Arc<dyn Store>, agent: Arc<dyn ProvisioningAgent>) -> Self {
        Self {
            store,
            agent,
            pass_lock: Mutex::new(()),
        }
    }

    /// Run one pass now. `None` if another pass holds the lock.
    pub async fn run_pass(&self) -> ControlPlaneResult<Option<PassReport>> {
        self.run_pass_at(Utc::now()).await
    }

    /// Run one pass as of `now`
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> ControlPlaneResult<Option<PassReport>> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            info!("billing pass already running in this process, skipping");
            return Ok(None);
        };

        let Some(lock) = self.store.try_billing_lock().await? else {
            info!("billing pass already running elsewhere, skipping");
            return Ok(None);
        };

        let result = self.process_running(now).await;
        lock.release().await;
        result.map(Some)
    }

    async fn process_running(&self, now: DateTime<Utc>) -> ControlPlaneResult<PassReport> {
        let instances = self
            .store
            .instances_with_status(InstanceStatus::Running)
            .await?;

        let mut report = PassReport {
            scanned: instances.len(),
            ..Default::default()
        };

        // Sequential on purpose: one instance at a time against the agent.
        for instance in &instances {
            if let Err(e) = self.bill_instance(instance, now, &mut report).await {
                report.failed += 1;
                error!(
                    instance_id = %instance.id,
                    db_name = %instance.db_name,
                    error = %e,
                    "billing failed for instance"
                );
            }
        }

        info!(
            scanned = report.scanned,
            charged = report.charged,
            skipped = report.skipped,
            suspended = report.suspended,
            failed = report.failed,
            total_charged = %report.total_charged,
            "billing pass complete"
        );
        Ok(report)
    }

    async fn bill_instance(
        &self,
        instance: &Instance,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> ControlPlaneResult<()> {
        let Some(wallet) = self.store.wallet_for_user(&instance.user_id).await? else {
            warn!(instance_id = %instance.id, user_id = %instance.user_id, "no wallet for instance owner, skipping");
            report.skipped += 1;
            return Ok(());
        };

        match window_charge(instance, Some(wallet.id), now) {
            None => {
                debug!(instance_id = %instance.id, "window under a minute, skipping");
                report.skipped += 1;
            }
            Some(charge) => {
                if self
                    .store
                    .usage_record_exists(instance.id, charge.start)
                    .await?
                {
                    debug!(instance_id = %instance.id, start = %charge.start, "window already billed");
                    report.skipped += 1;
                } else {
                    match self.store.record_usage(&charge).await {
                        Ok(outcome) => {
                            report.charged += 1;
                            report.total_charged += outcome.record.amount;
                            info!(
                                instance_id = %instance.id,
                                usage_id = %outcome.record.id,
                                duration_seconds = outcome.record.duration_seconds,
                                amount = %outcome.record.amount,
                                "usage charged"
                            );
                        }
                        Err(StoreError::DuplicateWindow { .. }) => {
                            debug!(instance_id = %instance.id, "window committed concurrently");
                            report.skipped += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        let balance = self
            .store
            .wallet(wallet.id)
            .await?
            .map(|w| w.balance)
            .ok_or_else(|| ControlPlaneError::WalletNotFound {
                id: wallet.id.to_string(),
            })?;

        if balance < Decimal::ZERO {
            self.suspend_insolvent(instance, balance).await?;
            report.suspended += 1;
        }

        Ok(())
    }

    async fn suspend_insolvent(&self, instance: &Instance, balance: Decimal) -> ControlPlaneResult<()> {
        warn!(
            instance_id = %instance.id,
            user_id = %instance.user_id,
            %balance,
            "wallet negative, suspending instance"
        );

        let response = self
            .agent
            .suspend(instance.engine, &instance.db_name, &instance.db_user)
            .await;
        if !response.success {
            return Err(ControlPlaneError::AgentFailure {
                instance_id: instance.id.to_string(),
                operation: "suspend".to_string(),
                reason: response.error_message("Suspend failed"),
            });
        }

        match self
            .store
            .transition_instance(
                instance.id,
                InstanceTransition::new(InstanceStatus::Running, InstanceStatus::Suspended),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(message)) => {
                warn!(instance_id = %instance.id, %message, "instance changed state during suspension");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs billing passes on a fixed interval until shut down
pub struct BillingScheduler {
    engine: Arc<BillingEngine>,
    interval: StdDuration,
    shutdown: Arc<Notify>,
}

impl BillingScheduler {
    pub fn new(engine: Arc<BillingEngine>, interval: StdDuration) -> Self {
        Self {
            engine,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle to stop the loop with `notify_one`
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// First pass runs immediately; late ticks are dropped, not bunched.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "billing scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("billing scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.engine.run_pass().await {
                        Ok(Some(_)) => {}
                        Ok(None) => debug!("billing pass skipped"),
                        Err(e) => error!(error = %e, "billing pass failed"),
                    }
                }
            }
        }
    }
}
