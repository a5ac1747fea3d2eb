use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carousel::config::Config;
use carousel::dispatch::{Dispatcher, LogHandler};
use carousel::gateway::PublishGateway;
use carousel::server::{AppState, build_router};
use carousel::store::RedisStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carousel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let store = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to Redis")?
            .with_dead_letter_queue(config.dead_letter_queue.clone()),
    );

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::start_with_shutdown(
        Arc::clone(&store),
        LogHandler,
        config.dispatcher_config(),
        shutdown.clone(),
    );

    let gateway = PublishGateway::new(store, config.queue.clone(), config.notify_channel.clone());
    let app = build_router(AppState::new(gateway, config.dead_letter_queue.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, queue = %config.queue, "listening");

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await;

    // Stop consuming whether the server exited cleanly or not.
    shutdown.cancel();
    match dispatcher.shutdown().await {
        Ok(report) => info!(elapsed = ?report.elapsed, "dispatcher stopped"),
        Err(e) => warn!(error = %e, "dispatcher stopped with abandoned work"),
    }

    served.context("server error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                if let Err(e) = ctrl_c.await {
                    error!(error = %e, "failed to install CTRL+C handler");
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!(error = %e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    }

    info!("received shutdown signal");
}
