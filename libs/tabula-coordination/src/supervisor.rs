use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoordinationError;
use crate::service::BoxFuture;

// ═══════════════════════════════════════════════════════════════
//  Supervised task
// ═══════════════════════════════════════════════════════════════

/// Run the future built by `factory` in its own task and rebuild it after
/// `restart_delay` whenever it panics or returns, until `token` is cancelled.
///
/// Background loops (heartbeat, lease keep-alive) must outlive any single
/// failure. The panic boundary is the inner `tokio::spawn`.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    token: CancellationToken,
    restart_delay: Duration,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(factory());
            let abort = handle.abort_handle();

            let outcome = tokio::select! {
                res = handle => res,
                _ = token.cancelled() => {
                    abort.abort();
                    break;
                }
            };

            match outcome {
                Ok(()) if token.is_cancelled() => break,
                Ok(()) => tracing::warn!(task = name, "background task exited, restarting"),
                Err(e) if e.is_panic() => {
                    tracing::error!(task = name, error = %e, "background task panicked, restarting");
                }
                Err(e) => {
                    tracing::warn!(task = name, error = %e, "background task cancelled");
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(restart_delay) => {}
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!(task = name, "stopped");
    })
}

// ═══════════════════════════════════════════════════════════════
//  Heartbeat loop
// ═══════════════════════════════════════════════════════════════

/// Call `beat` every `interval`. A failed beat is logged and retried after
/// `retry_delay`. Returns only when `token` is cancelled.
pub async fn heartbeat_loop<F>(
    instance: String,
    token: CancellationToken,
    interval: Duration,
    retry_delay: Duration,
    mut beat: F,
) where
    F: FnMut() -> BoxFuture<'static, Result<(), CoordinationError>>,
{
    loop {
        let delay = match beat().await {
            Ok(()) => {
                tracing::trace!(%instance, "heartbeat");
                interval
            }
            Err(e) => {
                tracing::warn!(
                    %instance,
                    error = %e,
                    "heartbeat failed, retrying in {}s",
                    retry_delay.as_secs()
                );
                retry_delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return,
        }
    }
}
