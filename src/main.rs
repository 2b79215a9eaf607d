use anyhow::{Context, Result};
use flume::{unbounded, Receiver};
use tracing_subscriber::EnvFilter;

use pollhost_backend::config::HostConfig;
use pollhost_backend::runtime::HostRuntime;
use pollhost_backend::server;
use pollhost_backend::workers::HostEvent;

fn main() -> Result<()> {
    // Before the subscriber, so RUST_LOG from .env applies too.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pollhost=debug,pollhost_backend=debug")),
        )
        .init();

    tracing::info!("pollhost starting...");
    match dotenv {
        Ok(path) => tracing::info!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => tracing::debug!(".env not found, using process environment"),
        Err(e) => tracing::warn!(".env not loaded: {}", e),
    }

    let config = HostConfig::load().context("failed to load configuration")?;
    let (event_tx, event_rx) = unbounded();

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(async move {
        let runtime = HostRuntime::bootstrap(config, event_tx)
            .context("failed to bootstrap pollhost runtime")?;

        match runtime.config.api_bind.clone() {
            Some(bind) => {
                let state = server::build_state(
                    runtime.database.clone(),
                    runtime.conversation.clone(),
                    runtime.config.poll_document_id.clone(),
                )?;
                tokio::spawn(async move {
                    if let Err(e) = server::serve_api(&bind, state, event_rx).await {
                        tracing::error!("API server error: {:#}", e);
                    }
                });
            }
            None => spawn_event_logger(event_rx),
        }

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        runtime.run(shutdown).await
    })?;

    tracing::info!("pollhost stopped");
    Ok(())
}

fn spawn_event_logger(event_rx: Receiver<HostEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            tracing::debug!("{:?}", event);
        }
    });
}
