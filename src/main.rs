/*!
 * objbroker - Main Entry Point
 *
 * Starts the reactor thread and keeps it alive until Ctrl+C.
 */

use anyhow::Context;
use objbroker::{init_tracing, ServerConfig, ServerHandle};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("objbroker starting...");
    info!("================================================");

    let config = ServerConfig::from_env();
    info!(
        backend = ?config.poll_backend,
        max_handles = config.max_handles,
        reply_max_size = config.reply_max_size,
        slow_request_ms = config.slow_request_ms,
        "configuration loaded"
    );

    let (handle, join) = ServerHandle::spawn(config).context("starting server thread")?;

    info!("Server initialization complete");
    info!("================================================");
    info!("Press Ctrl+C to exit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }

    info!("Shutting down...");
    handle.shutdown();
    let outcome = tokio::task::spawn_blocking(move || join.join())
        .await
        .context("joining server thread")?;
    match outcome {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("server thread panicked"),
    }
    info!("objbroker stopped");
    Ok(())
}
