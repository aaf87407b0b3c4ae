mod http;
mod server;
mod stdio;

pub use server::BorisServer;

use std::sync::Arc;

use boris_core::ServerConfig;
use boris_core::config::TransportKind;
use tracing::warn;

/// Serve the configured transport until shutdown.
pub async fn run_main(config: ServerConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    match config.transport {
        TransportKind::Http => http::run(config).await,
        TransportKind::Stdio => stdio::run(config).await,
    }
}

/// Resolves on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install SIGINT handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
