//! CLI command implementations
//!
//! Each command loads and validates its configuration before touching any
//! external system.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::{agent_routes, AgentClient, AgentService, AgentState};
use crate::config::{AgentConfig, BillingConfig};
use crate::control_plane::{BillingEngine, BillingScheduler, PgStore};
use crate::engines::AdapterRegistry;

use super::args::Command;
use super::errors::CliResult;

/// Dispatch a parsed command
pub async fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Agent { port } => agent(port).await,
        Command::Billing { once } => billing(once).await,
    }
}

/// Serve the provisioning agent until ctrl-c
pub async fn agent(port_override: Option<u16>) -> CliResult<()> {
    let mut config = AgentConfig::from_env()?;
    if let Some(port) = port_override {
        config.port = port;
    }
    config.validate()?;

    let registry = AdapterRegistry::connect(&config.adapters).await?;
    let service = AgentService::new(registry).with_password_length(config.password_length);
    let app = agent_routes(Arc::new(AgentState::new(service, config.token.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "provisioning agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("provisioning agent stopped");
    Ok(())
}

/// Run the billing scheduler, or one pass with `once`
pub async fn billing(once: bool) -> CliResult<()> {
    let config = BillingConfig::from_env()?;
    config.validate()?;

    let store = PgStore::connect(&config.database_url, config.database_pool_size).await?;
    store.migrate().await?;
    let agent = AgentClient::new(config.agent_client())?;
    let engine = Arc::new(BillingEngine::new(Arc::new(store), Arc::new(agent)));

    if once {
        match engine.run_pass().await? {
            Some(report) => info!(
                charged = report.charged,
                suspended = report.suspended,
                failed = report.failed,
                "single billing pass finished"
            ),
            None => warn!("another billing pass is running; nothing done"),
        }
        return Ok(());
    }

    let scheduler = BillingScheduler::new(engine, config.billing_interval);
    let shutdown = scheduler.shutdown_handle();
    let handle = tokio::spawn(scheduler.run());

    shutdown_signal().await;
    shutdown.notify_one();
    if let Err(e) = handle.await {
        warn!(error = %e, "billing scheduler task ended abnormally");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
