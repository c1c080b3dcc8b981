// src/main.rs
//! Sandbox Engine daemon
//!
//! Serves the RPC gateway over TCP and runs tasks on the four engines until
//! interrupted.

use anyhow::{Context, Result};
use sandbox_engine::agent::{AgentRunner, HttpLlmClient, InMemoryLedger, LlmClient};
use sandbox_engine::gateway::{GatewayServer, StaticTokenAuthenticator};
use sandbox_engine::observability::{describe_metrics, init_tracing, TracingTelemetry};
use sandbox_engine::{BuildInfo, Dispatcher, EngineConfig, Engines, ResourceGovernor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;
    init_tracing(config.logging.format)?;
    describe_metrics();

    let build = BuildInfo::current();
    info!(
        version = build.version,
        workers = config.dispatcher.workers,
        workspaces = %config.workspace.base_dir.display(),
        "starting sandbox engine"
    );

    let governor = Arc::new(ResourceGovernor::new(config.quotas.clone()));
    let engines = Engines::from_config(&config, Arc::clone(&governor))?;
    let mut dispatcher = Dispatcher::new(
        config.dispatcher.clone(),
        engines.clone(),
        governor,
        Arc::new(TracingTelemetry),
    );

    if config.agent.enabled {
        let llm = Arc::new(HttpLlmClient::new(&config.agent)?);
        let ledger = Arc::new(InMemoryLedger::new(config.agent.token_allowance));
        info!(llm = %llm.description(), "agent tasks enabled");
        dispatcher = dispatcher.with_agents(Arc::new(AgentRunner::new(config.agent.clone(), llm, ledger)));
    }

    let shutdown = CancellationToken::new();
    let reaper = engines.micro.spawn_reaper(shutdown.child_token());

    let auth = StaticTokenAuthenticator::new(&config.auth);
    if auth.is_empty() {
        warn!("no auth tokens configured, every request will be rejected");
    }
    let server = Arc::new(GatewayServer::new(
        &config.server,
        &config.workspace,
        dispatcher.clone(),
        Arc::new(auth),
    ));
    let listener = server.bind().await?;
    let serving = tokio::spawn(Arc::clone(&server).serve(listener, shutdown.child_token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    info!("received shutdown signal, cleaning up");

    shutdown.cancel();
    dispatcher.shutdown().await;
    engines.micro.pool().shutdown().await;

    match serving.await {
        Ok(Ok(())) => info!("gateway stopped gracefully"),
        Ok(Err(e)) => error!(error = %e, "gateway error"),
        Err(e) => error!(error = %e, "gateway task failed"),
    }
    if let Err(e) = reaper.await {
        error!(error = %e, "vm reaper task failed");
    }
    Ok(())
}
