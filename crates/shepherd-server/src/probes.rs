use std::net::SocketAddr;

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Serve `/healthz` and `/readyz` on the probe address.
pub async fn serve_health(
    addr: &str,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .layer(TraceLayer::new_for_http());
    serve(addr, app, shutdown).await
}

/// Serve a minimal Prometheus-style exposition on the metrics address.
pub async fn serve_metrics(
    addr: &str,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http());
    serve(addr, app, shutdown).await
}

async fn ok() -> &'static str {
    "ok"
}

async fn metrics() -> &'static str {
    concat!(
        "# HELP shepherd_up Whether the controller process is running.\n",
        "# TYPE shepherd_up gauge\n",
        "shepherd_up 1\n",
    )
}

async fn serve(
    addr: &str,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let addr = normalize(addr)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    Ok(tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = server.await {
            warn!(error = %err, "http server error");
        }
    }))
}

/// Accept the `:8080` shorthand the flags default to.
fn normalize(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    addr.parse()
        .with_context(|| format!("invalid bind address '{addr}'"))
}
