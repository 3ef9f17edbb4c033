//! Guaranteed finalizers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::CancellationToken;

/// Runs `operation`, then always runs `cleanup` bounded by `cleanup_timeout`.
///
/// Returns the operation's output and the cleanup output, or `None` for the
/// latter if it timed out.
pub async fn run_with_cleanup<T, F, C, CFut, R>(
    operation: F,
    cleanup: C,
    cleanup_timeout: Duration,
) -> (T, Option<R>)
where
    F: Future<Output = T>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = R>,
{
    let result = operation.await;

    let cleanup_result = tokio::time::timeout(cleanup_timeout, cleanup()).await;
    if cleanup_result.is_err() {
        warn!(
            timeout_ms = u64::try_from(cleanup_timeout.as_millis()).unwrap_or(u64::MAX),
            "Cleanup timed out"
        );
    }

    (result, cleanup_result.ok())
}

/// Cancels `token` when the process receives Ctrl-C.
///
/// The returned handle can be aborted once the run is over.
pub fn cancel_on_interrupt(token: Arc<CancellationToken>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                token.cancel("interrupted");
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    })
}
