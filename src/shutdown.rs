//! Signal-driven cancellation.
//!
//! A single root token fans out to everything cancellable: the watch
//! loop, retry waits inside the protocol client, and the multiplexer's
//! writer tasks. The first SIGINT or SIGTERM cancels the token so those
//! drain cleanly; a second signal exits on the spot.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn the signal listener and hand back the root token.
pub(crate) fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();

    let root = token.clone();
    tokio::spawn(async move {
        next_signal().await;
        info!("shutdown requested, draining in-flight work (signal again to force exit)");
        root.cancel();
        next_signal().await;
        warn!("second signal, exiting immediately");
        std::process::exit(130);
    });

    token
}

#[cfg(unix)]
async fn next_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn next_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
