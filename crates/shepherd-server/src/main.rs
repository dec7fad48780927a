mod probes;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use shepherd_controllers::{
    ClusterHandler, FlexClusterHandler, NetworkPermissionHandler, ProjectHandler,
};
use shepherd_engine::{env_client_factory, Manager};
use shepherd_store::{Gvk, InMemoryStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "shepherd",
    about = "Declarative controller for externally managed cloud resources",
    version
)]
struct Args {
    /// The address the metrics endpoint binds to.
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// The address the health probe endpoint binds to.
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Enable leader election for the controller manager.
    #[arg(long, default_value_t = false)]
    leader_elect: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    if args.leader_elect {
        warn!("leader election is not configured; running as a single instance");
    }

    let store = Arc::new(InMemoryStore::new());
    let mut manager = Manager::new(store.clone());

    let group = "shepherd.io";
    let clients = env_client_factory();
    manager.register(
        Gvk::new(group, "v1", "Project"),
        Arc::new(ProjectHandler::new(store.clone())),
        clients.clone(),
    );
    manager.register(
        Gvk::new(group, "v1", "FlexCluster"),
        Arc::new(FlexClusterHandler::new(store.clone())),
        clients.clone(),
    );
    manager.register(
        Gvk::new(group, "v1", "Cluster"),
        Arc::new(ClusterHandler::new(store.clone())),
        clients.clone(),
    );
    manager.register(
        Gvk::new(group, "v1", "NetworkPermissionEntry"),
        Arc::new(NetworkPermissionHandler::new()),
        clients,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = probes::serve_health(&args.health_probe_bind_address, shutdown_rx.clone())
        .await
        .context("unable to set up health endpoint")?;
    let metrics = probes::serve_metrics(&args.metrics_bind_address, shutdown_rx.clone())
        .await
        .context("unable to set up metrics endpoint")?;

    info!("starting manager");
    let runner = tokio::spawn(async move { manager.run(shutdown_rx).await });

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    let _ = health.await;
    let _ = metrics.await;

    Ok(())
}
