//! Timeout helpers.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Outcome of [`with_cooperative_deadline`].
#[derive(Debug)]
pub enum Deadline<T> {
    /// The future finished inside its budget.
    Finished(T),
    /// The budget expired. `drained` tells whether the future wound down
    /// within the grace period after cancellation was signalled.
    Expired { drained: bool },
}

/// Run `future` with a wall-clock budget.
///
/// When the budget expires the token is cancelled and the future is polled
/// for up to `grace` more so an in-flight call can finish. Whatever it
/// produces in that window is dropped.
pub async fn with_cooperative_deadline<T>(
    budget: Duration,
    grace: Duration,
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Deadline<T> {
    tokio::pin!(future);
    tokio::select! {
        out = &mut future => Deadline::Finished(out),
        _ = tokio::time::sleep(budget) => {
            cancel.cancel();
            let drained = tokio::time::timeout(grace, &mut future).await.is_ok();
            Deadline::Expired { drained }
        }
    }
}
