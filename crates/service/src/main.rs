//! berth platform server.

use anyhow::Result;
use berth_channels::ChannelRegistry;
use berth_dispatch::api::DispatchWorkflowApi;
use berth_dispatch::proposals::ProposalService;
use berth_dispatch::reconcile::{run_reconcile_loop, Reconciler};
use berth_dispatch::runtime::ExecutionRuntime;
use berth_dispatch::{DispatchStore, Dispatcher};
use berth_service::bridges::{AdapterChannelSender, RegistryBridge};
use berth_service::scheduler::Scheduler;
use berth_service::state::{AppState, ServiceConfig};
use berth_session::messages::SweepQuestions;
use berth_session::registry::Collaborators;
use berth_session::store::SessionStore;
use berth_session::SessionRegistry;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "berth-service", about = "berth agent-orchestration platform server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("berth_service=info,berth_session=info,berth_dispatch=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServiceConfig::load(path).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        None => ServiceConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let config = Arc::new(config);

    tracing::info!(
        listen = %config.listen,
        db = %config.platform.db_path,
        "starting berth service"
    );

    // One SQLite database shared by the session and dispatch stores.
    let session_store = SessionStore::open(std::path::Path::new(&config.platform.db_path))
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let dispatch_store = DispatchStore::attach(session_store.db())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let registry = SessionRegistry::new(session_store, Arc::new(config.platform.clone()));
    let channels = Arc::new(ChannelRegistry::with_builtins());

    let dispatcher = Arc::new(Dispatcher::new(
        dispatch_store.clone(),
        Arc::new(RegistryBridge::new(registry.clone())),
        config.platform.limits.clone(),
    ));
    let runtime = ExecutionRuntime::new(dispatch_store.clone());
    let proposals = ProposalService::new(dispatch_store.clone());

    // Holders reach the workflow engine and the channels through these.
    registry.set_collaborators(Collaborators {
        workflow_api: Some(Arc::new(DispatchWorkflowApi::new(
            dispatcher.clone(),
            runtime.clone(),
            proposals.clone(),
        ))),
        pr: None,
        images: None,
        catalog: None,
        channel_sender: Some(Arc::new(AdapterChannelSender::new(
            registry.clone(),
            channels.clone(),
            config.clone(),
        ))),
    });

    // Background loops: reconciliation, schedule firing, question expiry.
    tokio::spawn(run_reconcile_loop(
        Reconciler::new(dispatch_store, config.platform.approval_ttl_secs),
        Duration::from_secs(config.platform.reconcile_interval_secs),
    ));
    tokio::spawn(Scheduler::new(dispatcher.clone()).run());
    tokio::spawn(question_sweep_loop(
        registry.clone(),
        Duration::from_secs(config.platform.question_sweep_secs),
    ));

    let state = AppState {
        registry,
        channels,
        dispatcher,
        runtime,
        proposals,
        config: config.clone(),
    };

    let app = berth_service::routes::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodic pending-question expiry across all live holders.
async fn question_sweep_loop(registry: Arc<SessionRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for actor in registry.live_actors().await {
            let _ = actor.tell(SweepQuestions).await;
        }
    }
}
