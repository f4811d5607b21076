use std::pin::Pin;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp, WatchOptions};
use futures::{Stream, StreamExt};
use pps_types::{Pipeline, PipelineState};

use crate::error::Error;

/// An event from [`DesiredStateStore::watch`]: a PUT or DELETE against a
/// key, carrying its version and store revision. Transport errors are
/// modeled as the `Result` the stream itself yields rather than a field
/// on this enum.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put {
        key: String,
        version: u64,
        revision: i64,
    },
    Delete {
        key: String,
        version: u64,
        revision: i64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            WatchEvent::Put { version, .. } | WatchEvent::Delete { version, .. } => *version,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put { revision, .. } | WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, Error>> + Send>>;

/// The transactional key-value store holding desired pipeline state.
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    /// Opens an ordered watch over the whole pipelines collection.
    /// Fails with `Error::WatchCreation` if the store rejects the watch.
    async fn watch(&self) -> Result<WatchStream, Error>;

    /// Reads the authoritative record for `name`, at a revision at least
    /// `min_revision` if given. Returns `Ok(None)` if the pipeline has been
    /// deleted.
    async fn get(&self, name: &str, min_revision: Option<i64>) -> Result<Option<Pipeline>, Error>;

    /// Compare-and-swap: succeeds only if the stored state equals
    /// `expected_state` (or unconditionally if `None`). On mismatch,
    /// returns a [`CasError::Transition`] carrying the state actually
    /// observed.
    async fn compare_and_swap(
        &self,
        name: &str,
        expected_state: Option<PipelineState>,
        mutate: &mut dyn FnMut(&mut Pipeline),
    ) -> Result<(), CasError>;
}

/// Outcome of a failed [`DesiredStateStore::compare_and_swap`].
#[derive(Debug)]
pub enum CasError {
    /// The expected precondition did not hold; carries the state actually
    /// observed so the caller can decide whether that's a graceful exit
    /// (e.g. `Paused`) or a real error.
    Transition { current: PipelineState },
    Store(Error),
}

impl From<Error> for CasError {
    fn from(e: Error) -> Self {
        CasError::Store(e)
    }
}

/// Production [`DesiredStateStore`] backed by etcd, storing pipeline
/// records as JSON under `<prefix>/pipelines/<name>`.
pub struct EtcdStore {
    client: Client,
    prefix: String,
}

impl EtcdStore {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn collection_prefix(&self) -> String {
        format!("{}/pipelines/", self.prefix)
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.collection_prefix(), name)
    }
}

#[async_trait]
impl DesiredStateStore for EtcdStore {
    async fn watch(&self) -> Result<WatchStream, Error> {
        let mut client = self.client.clone();
        let prefix = self.collection_prefix();
        let (_watcher, stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::WatchCreation(e.to_string()))?;

        // One `WatchResponse` can carry several kv events; flatten so the
        // master sees them one at a time, in delivery order.
        let collection_prefix = self.collection_prefix();
        let out = stream.flat_map(move |res| {
            let collection_prefix = collection_prefix.clone();
            match res {
                Ok(resp) => {
                    let events: Vec<Result<WatchEvent, Error>> = resp
                        .events()
                        .iter()
                        .map(|ev| Ok(to_watch_event(ev, &collection_prefix)))
                        .collect();
                    futures::stream::iter(events)
                }
                Err(e) => futures::stream::iter(vec![Err(Error::TransientStore(e))]),
            }
        });
        Ok(Box::pin(out))
    }

    async fn get(&self, name: &str, min_revision: Option<i64>) -> Result<Option<Pipeline>, Error> {
        let mut client = self.client.clone();
        let key = self.key_for(name);
        let mut opts = GetOptions::new();
        if let Some(rev) = min_revision {
            opts = opts.with_revision(rev);
        }
        let resp = client
            .get(key, Some(opts))
            .await
            .map_err(Error::TransientStore)?;
        match resp.kvs().first() {
            None => Ok(None),
            Some(kv) => {
                let mut pipeline: Pipeline = serde_json::from_slice(kv.value())?;
                pipeline.revision = kv.mod_revision();
                Ok(Some(pipeline))
            }
        }
    }

    async fn compare_and_swap(
        &self,
        name: &str,
        expected_state: Option<PipelineState>,
        mutate: &mut dyn FnMut(&mut Pipeline),
    ) -> Result<(), CasError> {
        let mut client = self.client.clone();
        let key = self.key_for(name);
        let current = self
            .get(name, None)
            .await
            .map_err(CasError::Store)?
            .ok_or(CasError::Store(Error::NotFound))?;

        if let Some(expected) = expected_state {
            if current.state != expected {
                return Err(CasError::Transition { current: current.state });
            }
        }

        let mut next = current.clone();
        mutate(&mut next);
        let value = serde_json::to_vec(&next).map_err(Error::Decode)?;

        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                current.revision,
            )])
            .and_then(vec![TxnOp::put(key.clone(), value, None)]);
        let resp = client.txn(txn).await.map_err(Error::TransientStore)?;
        if !resp.succeeded() {
            // Lost the race; re-read to report the state an interleaved
            // writer left behind.
            let observed = self.get(name, None).await.map_err(CasError::Store)?;
            let current_state = observed.map(|p| p.state).unwrap_or(current.state);
            return Err(CasError::Transition {
                current: current_state,
            });
        }
        Ok(())
    }
}

fn to_watch_event(ev: &etcd_client::Event, collection_prefix: &str) -> WatchEvent {
    let kv = ev.kv().expect("etcd watch event always carries a kv");
    let raw_key = String::from_utf8_lossy(kv.key()).into_owned();
    let key = raw_key
        .strip_prefix(collection_prefix)
        .map(str::to_string)
        .unwrap_or(raw_key);
    match ev.event_type() {
        EventType::Put => WatchEvent::Put {
            key,
            version: kv.version() as u64,
            revision: kv.mod_revision(),
        },
        EventType::Delete => WatchEvent::Delete {
            key,
            version: kv.version() as u64,
            revision: kv.mod_revision(),
        },
    }
}

