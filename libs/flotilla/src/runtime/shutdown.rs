//! Process shutdown signal handling.

use tokio::signal;

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown() -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("failed to install Ctrl+C handler: {e}"))
    };

    #[cfg(unix)]
    let terminate = async {
        let mut handler = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {e}"))?;
        handler.recv().await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        result = terminate => {
            result?;
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
    }
    Ok(())
}
