//! Per-pipeline supervisor tasks (standby/cron monitors, crashing
//! monitor), tracked by two maps behind one mutex so `start`/`cancel`
//! are idempotent and at most one task per pipeline per map is ever
//! live.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use pps_types::PipelineKey;
use tokio_util::sync::CancellationToken;

/// Which of the registry's two maps an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMap {
    /// Standby monitors and cron drivers, keyed by pipeline name (cron
    /// drivers further namespace their key by cron input name).
    Monitor,
    /// Crashing monitors, keyed by pipeline name.
    Crashing,
}

struct Entry {
    generation: u64,
    cancellation: CancellationToken,
}

#[derive(Default)]
struct Inner {
    monitors: HashMap<PipelineKey, Entry>,
    crashing: HashMap<PipelineKey, Entry>,
    next_generation: u64,
}

impl Inner {
    fn bucket_mut(&mut self, map: MonitorMap) -> &mut HashMap<PipelineKey, Entry> {
        match map {
            MonitorMap::Monitor => &mut self.monitors,
            MonitorMap::Crashing => &mut self.crashing,
        }
    }
}

/// Owns per-pipeline supervisor tasks, starting/cancelling them
/// idempotently.
#[derive(Default)]
pub struct MonitorRegistry {
    inner: Mutex<Inner>,
}

impl MonitorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cancels and replaces any existing entry for `key` in `map`, then
    /// spawns `body` with a fresh cancellation token. The spawned task
    /// removes its own entry on exit, unless it has since been replaced.
    pub fn start<F, Fut>(self: &Arc<Self>, map: MonitorMap, key: impl Into<PipelineKey>, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let cancellation = CancellationToken::new();
        let generation = {
            let mut inner = self.inner.lock();
            let generation = inner.next_generation;
            inner.next_generation += 1;
            if let Some(old) = inner.bucket_mut(map).remove(&key) {
                old.cancellation.cancel();
            }
            inner.bucket_mut(map).insert(
                key.clone(),
                Entry {
                    generation,
                    cancellation: cancellation.clone(),
                },
            );
            generation
        };

        let registry = self.clone();
        let task_token = cancellation.clone();
        tokio::spawn(async move {
            body(task_token).await;
            registry.remove_if_current(map, &key, generation);
        });
    }

    fn remove_if_current(&self, map: MonitorMap, key: &PipelineKey, generation: u64) {
        let mut inner = self.inner.lock();
        let bucket = inner.bucket_mut(map);
        if bucket.get(key).is_some_and(|e| e.generation == generation) {
            bucket.remove(key);
        }
    }

    /// No-op if no entry exists for `key`.
    pub fn cancel(&self, map: MonitorMap, key: &PipelineKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.bucket_mut(map).remove(key) {
            entry.cancellation.cancel();
        }
    }

    /// Cron driver keys currently registered under `pipeline` (keys of
    /// the form `pipeline/cron/<name>`), for diffing against the
    /// pipeline's current cron inputs so stale drivers can be cancelled.
    pub fn cron_keys_for(&self, pipeline: &PipelineKey) -> Vec<PipelineKey> {
        let inner = self.inner.lock();
        let prefix = format!("{pipeline}/cron/");
        inner.monitors.keys().filter(|k| k.as_str().starts_with(&prefix)).cloned().collect()
    }

    /// Cancels the pipeline's crashing monitor, its standby monitor (if
    /// any) and every cron driver namespaced under it.
    pub fn cancel_pipeline(&self, pipeline: &PipelineKey) {
        self.cancel(MonitorMap::Crashing, pipeline);
        let mut inner = self.inner.lock();
        let prefix = format!("{pipeline}/");
        let keys: Vec<PipelineKey> = inner
            .monitors
            .keys()
            .filter(|k| *k == pipeline || k.as_str().starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = inner.monitors.remove(&key) {
                entry.cancellation.cancel();
            }
        }
    }

    /// Invokes and clears every handle in both maps.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.monitors.drain().map(|(_, e)| e) {
            entry.cancellation.cancel();
        }
        for entry in inner.crashing.drain().map(|(_, e)| e) {
            entry.cancellation.cancel();
        }
    }

    pub fn has(&self, map: MonitorMap, key: &PipelineKey) -> bool {
        self.inner.lock().bucket_mut(map).contains_key(key)
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.lock().monitors.len()
    }

    pub fn crashing_count(&self) -> usize {
        self.inner.lock().crashing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn starting_twice_cancels_the_first() {
        let registry = MonitorRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let c1 = cancelled.clone();
        registry.start(MonitorMap::Monitor, "p1", move |token| async move {
            token.cancelled().await;
            c1.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        registry.start(MonitorMap::Monitor, "p1", |token| async move {
            token.cancelled().await;
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(registry.monitor_count(), 1);
    }

    #[tokio::test]
    async fn cancel_all_clears_both_maps() {
        let registry = MonitorRegistry::new();
        registry.start(MonitorMap::Monitor, "p1", |token| async move {
            token.cancelled().await;
        });
        registry.start(MonitorMap::Crashing, "p1", |token| async move {
            token.cancelled().await;
        });
        tokio::task::yield_now().await;

        registry.cancel_all();
        tokio::task::yield_now().await;

        assert_eq!(registry.monitor_count(), 0);
        assert_eq!(registry.crashing_count(), 0);
    }
}
