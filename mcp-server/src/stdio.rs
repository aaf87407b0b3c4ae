use std::sync::Arc;

use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;

use boris_core::ServerConfig;

use crate::server::BorisServer;

/// Serve a single session over stdin/stdout. Protocol messages own stdout;
/// diagnostics go to stderr via tracing. SIGINT/SIGTERM close the session so
/// background tasks are reaped before exit.
pub async fn run(config: Arc<ServerConfig>) -> anyhow::Result<()> {
    let server = BorisServer::new(config, None);
    let session = server.session();

    let running = server.serve(stdio()).await?;
    info!("serving on stdio");

    tokio::select! {
        quit = running.waiting() => {
            quit?;
        }
        _ = crate::shutdown_signal() => {
            info!("shutting down");
        }
    }

    session.close().await;
    Ok(())
}
