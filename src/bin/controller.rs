use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use stopper::Stopper;
use tokio::sync::broadcast::Sender;
use tracing_subscriber::EnvFilter;

use scaleloop::{
    config::ControllerConfig, controller::Controller, decider::MemoryDeciders,
    filewatcher::FileWatcher, handler::create_app,
};

/// Generate future that awaits shutdown signal
async fn shutdown_signal(shutdown_signal_broadcast_tx: Sender<()>, stopper: Stopper) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install signal handler");
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

    tracing::info!("terminate signal received");

    let _ = shutdown_signal_broadcast_tx.send(());
    stopper.stop();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::try_from_env()?;
    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address `{}`", config.listen_addr))?;
    let client = kube::Client::try_default().await?;

    // Prepare shutdown signal futures
    let stopper = Stopper::new();
    let (shutdown_signal_broadcast_tx, mut shutdown_signal_broadcast_rx1) =
        tokio::sync::broadcast::channel::<()>(1);
    let mut shutdown_signal_broadcast_rx2 = shutdown_signal_broadcast_tx.subscribe();
    let shutdown_signal_fut = shutdown_signal(shutdown_signal_broadcast_tx, stopper.clone());
    tokio::spawn(async move {
        shutdown_signal_fut.await;
    });

    let deciders = Arc::new(MemoryDeciders::new());
    let controller = Controller::new(client, config.clone(), deciders.clone());

    // Reload hot configuration whenever the mounted directory changes
    let mut watcher = FileWatcher::new(
        {
            let store = controller.config();
            let config_dir = config.config_dir.clone();
            move |paths| {
                let store = store.clone();
                let config_dir = config_dir.clone();
                async move {
                    tracing::info!(?paths, "reloading configuration");
                    if let Err(error) = store.reload_dir(&config_dir).await {
                        tracing::error!(%error, "failed to reload configuration, keeping the previous one");
                    }
                }
            }
        },
        10,
        stopper,
    );
    watcher.watch(config.config_dir.clone());
    watcher.spawn()?;

    // Decision endpoint
    let app = create_app(deciders);
    let server_handle = tokio::spawn(
        axum::Server::bind(&listen_addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_signal_broadcast_rx1.recv().await;
            }),
    );
    tracing::info!(%listen_addr, "decision endpoint listening");

    controller
        .run(async move {
            let _ = shutdown_signal_broadcast_rx2.recv().await;
        })
        .await?;

    server_handle.await??;
    tracing::info!("terminated");

    Ok(())
}
