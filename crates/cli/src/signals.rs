//! Signal handling for cancelling an in-flight check.
//!
//! Listens for SIGTERM and SIGINT on Unix platforms and Ctrl+C on all
//! platforms. The first signal cancels the run's token; the detector then
//! stops the outstanding external step and cleans up its staging area.

use shadowdiff_core::CancellationToken;
use tracing::{info, warn};

/// Wait for a termination signal (SIGTERM, SIGINT, or Ctrl+C).
///
/// If a handler cannot be installed the corresponding branch never
/// resolves, so the run simply cannot be interrupted that way.
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

/// Cancel `token` on the first termination signal.
///
/// The watcher exits on its own once the token is cancelled elsewhere.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => token.cancel(),
            _ = token.cancelled() => {}
        }
    });
}
