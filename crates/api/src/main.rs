use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;

use redline_api::app::{build_app, AppState};
use redline_api::config::HarnessConfig;
use redline_api::playbook::Playbook;

fn main() -> anyhow::Result<()> {
    redline_observability::init().map_err(anyhow::Error::msg)?;

    let config = HarnessConfig::from_env()?;
    let playbook = match &config.playbook {
        Some(path) => Playbook::load(path)?,
        None => {
            tracing::warn!("REDLINE_PLAYBOOK not set; starting with no jobs or streams");
            Playbook::default()
        }
    };

    let jobs = Arc::new(playbook.registry(&config.runner())?);
    let collector = Arc::new(playbook.collector(config.collector())?);
    tracing::info!(
        jobs = jobs.len(),
        streams = playbook.streams.len(),
        "playbook loaded"
    );

    let collector_handle = if collector.is_empty() {
        None
    } else {
        Some(collector.clone().spawn().context("failed to spawn collector thread")?)
    };

    let app = build_app(AppState { jobs, collector });
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let served = runtime.block_on(serve(config.bind, app));

    if let Some(handle) = collector_handle {
        handle.shutdown();
    }
    served
}

async fn serve(bind: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown requested");
    }
}
