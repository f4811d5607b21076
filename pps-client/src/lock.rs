use async_trait::async_trait;
use etcd_client::{Client, LeaseKeepAliveStream, LeaseKeeper};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A held distributed lock. `cancellation` fires if the lock's underlying
/// session is lost (e.g. a network partition drops the lease), so every
/// task derived from holding the lock can cancel in turn.
pub struct LockSession {
    pub cancellation: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockSession {
    pub(crate) fn new(cancellation: CancellationToken, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancellation,
            release: Some(Box::new(release)),
        }
    }

    /// Releases the lock. Idempotent with `Drop`, which calls the same
    /// closure if `release` hasn't already run.
    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

/// Cluster-wide mutual exclusion with session-tied liveness.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Blocks until the lock is granted or `parent` is cancelled.
    async fn acquire(&self, parent: CancellationToken) -> Result<LockSession, Error>;
}

/// Production lock backed by an etcd lease: a single ephemeral key under
/// a fixed prefix, held alive by the lease's keep-alive stream for as
/// long as the returned [`LockSession`] lives.
pub struct EtcdLock {
    client: Client,
    key: String,
    ttl_secs: i64,
}

impl EtcdLock {
    pub fn new(client: Client, key: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            client,
            key: key.into(),
            ttl_secs,
        }
    }
}

#[async_trait]
impl DistributedLock for EtcdLock {
    async fn acquire(&self, parent: CancellationToken) -> Result<LockSession, Error> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.ttl_secs, None)
            .await
            .map_err(Error::TransientStore)?;
        let lease_id = lease.id();

        let mut lock_client = client.clone();
        let lock_resp = lock_client
            .lock(self.key.as_bytes().to_vec(), Some(etcd_client::LockOptions::new().with_lease(lease_id)))
            .await
            .map_err(Error::TransientStore)?;
        let lock_key = lock_resp.key().to_vec();

        let (keeper, keep_alive_stream) = client.lease_keep_alive(lease_id).await.map_err(Error::TransientStore)?;
        let cancellation = CancellationToken::new();
        spawn_keep_alive(keeper, keep_alive_stream, cancellation.clone(), parent);

        let mut unlock_client = client;
        let release_key = lock_key;
        let release = move || {
            let mut c = unlock_client.clone();
            let key = release_key.clone();
            tokio::spawn(async move {
                let _ = c.unlock(key).await;
            });
        };
        Ok(LockSession::new(cancellation, release))
    }
}

/// Drives the lease's keep-alive requests on a fixed cadence and signals
/// `session_lost` the moment the stream ends or the parent is cancelled,
/// matching the Go source's `ctx, err := masterLock.Lock(ctx)` pattern
/// where `ctx` itself carries session liveness.
fn spawn_keep_alive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    session_lost: CancellationToken,
    parent: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3));
        loop {
            tokio::select! {
                _ = parent.cancelled() => {
                    session_lost.cancel();
                    return;
                }
                _ = ticker.tick() => {
                    if keeper.keep_alive().await.is_err() {
                        session_lost.cancel();
                        return;
                    }
                }
                resp = stream.message() => {
                    match resp {
                        Ok(Some(_)) => continue,
                        _ => {
                            session_lost.cancel();
                            return;
                        }
                    }
                }
            }
        }
    });
}
