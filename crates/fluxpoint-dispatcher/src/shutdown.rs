//! Signal capture and cooperative shutdown.
//!
//! Signal trapping follows `common/lifecycle/src/signals.rs::wait_for_shutdown_signal`
//! (select over SIGINT and SIGTERM). That crate's full component-registration machinery is
//! more than this single-loop worker needs, so shutdown propagation here is a plain
//! `tokio_util::sync::CancellationToken` instead: the dispatcher loop checks it between
//! poll cycles and the ops server is handed it via axum's `with_graceful_shutdown`.

use std::time::Duration;

use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT or SIGTERM, then cancel `token`. A second signal received while a graceful
/// shutdown is already underway forces an immediate exit with code 130, mirroring shell
/// convention for "terminated by signal" so orchestrators don't wait out the drain deadline
/// twice.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    wait_for_one_signal().await;
    info!("shutdown signal received, starting graceful drain");
    token.cancel();

    wait_for_one_signal().await;
    warn!("second shutdown signal received, forcing exit");
    std::process::exit(130);
}

async fn wait_for_one_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

/// Bound a future by a hard drain deadline, logging if it had to be cut short. Used to cap how
/// long in-flight deliveries are allowed to run after shutdown begins.
pub async fn with_drain_deadline<F>(deadline: Duration, future: F)
where
    F: std::future::Future<Output = ()>,
{
    if tokio::time::timeout(deadline, future).await.is_err() {
        warn!(
            deadline_ms = deadline.as_millis() as u64,
            "drain deadline elapsed before in-flight deliveries finished"
        );
    }
}
