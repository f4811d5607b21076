//! Acquires the cluster-wide master lock before entering the
//! reconciliation loop, and retries the whole attempt — lock acquisition
//! included — under an exponential backoff that never gives up.

use std::sync::Arc;

use backoff::ExponentialBackoff;
use futures::future::BoxFuture;
use pps_client::{DistributedLock, Error as ClientError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::monitors::MonitorRegistry;

/// Error surfaced by a single leader-election attempt.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Client(#[from] ClientError),
}

pub(crate) type MainLoop = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), RunError>> + Send + Sync;

enum Outcome {
    ShuttingDown,
    Terminated,
}

/// Drives `main_loop` under leader election. Every retry drains
/// `registry` before re-attempting lock acquisition, so no supervisor
/// task from a previous attempt survives into the next.
///
/// `main_loop` is expected to run forever; if it returns `Ok(())` that's
/// treated as a process bug and the process exits so the deployment
/// controller restarts it.
pub async fn run_with_leader_election(
    lock: Arc<dyn DistributedLock>,
    registry: Arc<MonitorRegistry>,
    shutdown: CancellationToken,
    main_loop: Arc<MainLoop>,
) {
    let backoff_policy = ExponentialBackoff {
        max_elapsed_time: None,
        ..Default::default()
    };

    let outcome = backoff::future::retry(backoff_policy, || {
        let lock = lock.clone();
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let main_loop = main_loop.clone();
        async move {
            if shutdown.is_cancelled() {
                return Ok(Outcome::ShuttingDown);
            }
            registry.cancel_all();

            let session = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(Outcome::ShuttingDown),
                res = lock.acquire(shutdown.clone()) => {
                    res.map_err(|e| backoff::Error::transient(RunError::Client(e)))?
                }
            };

            info!("acquired master lock, entering reconciliation loop");
            let result = main_loop(session.cancellation.clone()).await;
            session.release();
            match result {
                Ok(()) => Ok(Outcome::Terminated),
                Err(e) => {
                    warn!(error = %e, "master loop exited with an error, retrying after backoff");
                    Err(backoff::Error::transient(e))
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(Outcome::ShuttingDown) => info!("shutdown requested, leaving the leader-election loop"),
        Ok(Outcome::Terminated) => {
            error!("master loop returned without error, which should never happen; terminating process");
            std::process::exit(1);
        }
        Err(_) => unreachable!("an exponential backoff with no max elapsed time never gives up"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pps_client::testing::InMemoryLock;

    use super::*;

    /// Two replicas contending for the same lock must never both be
    /// inside the main loop at once.
    #[tokio::test]
    async fn two_replicas_never_hold_the_lock_at_once() {
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let make_main_loop = || -> Arc<MainLoop> {
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            Arc::new(move |cancellation: CancellationToken| {
                let concurrent = concurrent.clone();
                let max_concurrent = max_concurrent.clone();
                Box::pin(async move {
                    let held = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(held, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancellation.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    }
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Err(RunError::Client(ClientError::LockLost))
                }) as BoxFuture<'static, Result<(), RunError>>
            })
        };

        let h1 = tokio::spawn(run_with_leader_election(
            lock.clone(),
            MonitorRegistry::new(),
            shutdown.clone(),
            make_main_loop(),
        ));
        let h2 = tokio::spawn(run_with_leader_election(lock, MonitorRegistry::new(), shutdown.clone(), make_main_loop()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), h1).await.expect("replica 1 should exit on shutdown").unwrap();
        tokio::time::timeout(Duration::from_secs(5), h2).await.expect("replica 2 should exit on shutdown").unwrap();

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
