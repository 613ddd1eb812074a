use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use outreach_api::app::{build_app, services::build_services};
use outreach_infra::config::EngineConfig;
use outreach_infra::dispatcher::LogTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outreach_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;
    let operator_token = config.operator_token.clone();
    if operator_token.is_none() {
        tracing::warn!("OUTREACH_OPERATOR_TOKEN not set; operator routes are unauthenticated");
    }

    let services = Arc::new(build_services(config, Arc::new(LogTransport)).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = services.start(shutdown_rx);

    let app = build_app(services.clone(), operator_token);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("shutting down; waiting for workers to finish their current job");
    let _ = shutdown_tx.send(true);
    engine.join().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
