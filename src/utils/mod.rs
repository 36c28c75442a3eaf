//! Background-task supervision helpers: `spawn_with_backoff` and
//! `spawn_with_backoff_cancel_on_shutdown`. The ambient shape every
//! long-lived worker in this crate (or an embedder's) wants: retry on
//! panic/error with backoff, stop retrying once a shutdown signal has
//! been observed.

use futures::future::Either;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawns a future that retries on failure or panic with `backoff_duration`
/// between attempts, until it succeeds or a shutdown signal is observed.
/// During shutdown, the in-flight attempt is cancelled immediately.
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        select! {
            () = retry_future(future_spawner, backoff_duration, &shutting_down) => {},
            () = await_shutdown_begin(&shutting_down) => {},
        }
    })
}

/// Spawns a future that retries on failure or panic with `backoff_duration`
/// between attempts, until it succeeds or a shutdown signal is observed.
/// During shutdown, the in-flight attempt is allowed to run to completion
/// (useful when it has its own cleanup to perform).
pub fn spawn_with_backoff<S, F>(future_spawner: S, backoff_duration: Duration) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        let retry = Either::Left(retry_future(future_spawner, backoff_duration, &shutting_down));
        let shutdown = Either::Right(await_shutdown_begin(&shutting_down));

        // If retry completes we return; if shutdown completes first we
        // still wait for retry to notice and wind down.
        futures::stream::iter(vec![retry, shutdown]).buffered(2).next().await;
    })
}

async fn await_shutdown_begin(shutting_down: &AtomicBool) {
    crate::shutdown::await_shutdown().await;
    shutting_down.store(true, Ordering::SeqCst);
}

async fn retry_future<S, F>(future_spawner: S, backoff_duration: Duration, shutting_down: &AtomicBool)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        let future = future_spawner();

        // Wrap in `AssertUnwindSafe` so we can call `catch_unwind` on it.
        let future = std::panic::AssertUnwindSafe(future);
        let result = future.catch_unwind().await;

        match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                error!("task failed: {e:?}");
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(backoff_duration).await;
            }
            Err(e) => {
                error!("task panicked: {e:?}");
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(backoff_duration).await;
            }
        }
    }
}
