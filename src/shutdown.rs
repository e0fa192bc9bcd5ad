use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels `token` when SIGTERM or SIGINT arrives.
///
/// If the signal handlers cannot be installed the token is left alone and
/// the process keeps running until something else cancels it.
pub fn install_shutdown_handler(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping DDL workers");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping DDL workers");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    })
}
