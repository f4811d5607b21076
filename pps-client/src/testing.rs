//! In-memory doubles for [`crate::DesiredStateStore`], [`crate::DistributedLock`],
//! [`crate::ContainerOrchestrator`] and [`crate::DataStore`], used by
//! `pps-runtime`'s property tests so they never touch etcd, Kubernetes, or
//! a real data store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use pps_types::{Pipeline, PipelineState};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::data_store::{CommitInfo, CommitRef, CommitState, CommitStream, DataStore, FileInfo};
use crate::error::Error;
use crate::lock::{DistributedLock, LockSession};
use crate::orchestrator::{ContainerOrchestrator, PodEvent, PodStream, Workload};
use crate::store::{CasError, DesiredStateStore, WatchEvent, WatchStream};

/// An in-process, in-memory [`DesiredStateStore`]. Cloning shares state
/// (it's an `Arc` handle), matching how test code hands the same backing
/// store to both the master under test and an assertion/injection side
/// channel.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<HashMap<String, Pipeline>>>,
    tx: Arc<broadcast::Sender<WatchEvent>>,
    revision: Arc<AtomicI64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            tx: Arc::new(tx),
            revision: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Test-side helper: insert/update a pipeline and emit a PUT event, as
    /// the RPC layer would after a CLI create/update call.
    pub fn put(&self, mut pipeline: Pipeline) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst);
        pipeline.revision = revision;
        let name = pipeline.name.clone();
        let version = pipeline.version;
        self.inner.lock().insert(name.clone(), pipeline);
        let _ = self.tx.send(WatchEvent::Put {
            key: name,
            version,
            revision,
        });
    }

    /// Test-side helper: delete a pipeline and emit a DELETE event.
    pub fn delete(&self, name: &str) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst);
        let removed = self.inner.lock().remove(name);
        let version = removed.map(|p| p.version).unwrap_or(0);
        let _ = self.tx.send(WatchEvent::Delete {
            key: name.to_string(),
            version,
            revision,
        });
    }

    pub fn snapshot(&self, name: &str) -> Option<Pipeline> {
        self.inner.lock().get(name).cloned()
    }
}

#[async_trait]
impl DesiredStateStore for InMemoryStore {
    async fn watch(&self) -> Result<WatchStream, Error> {
        let rx = self.tx.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|res| async move { res.ok().map(Ok) });
        Ok(Box::pin(stream))
    }

    async fn get(&self, name: &str, _min_revision: Option<i64>) -> Result<Option<Pipeline>, Error> {
        Ok(self.inner.lock().get(name).cloned())
    }

    async fn compare_and_swap(
        &self,
        name: &str,
        expected_state: Option<PipelineState>,
        mutate: &mut dyn FnMut(&mut Pipeline),
    ) -> Result<(), CasError> {
        let mut guard = self.inner.lock();
        let pipeline = guard.get_mut(name).ok_or(CasError::Store(Error::NotFound))?;
        if let Some(expected) = expected_state {
            if pipeline.state != expected {
                return Err(CasError::Transition {
                    current: pipeline.state,
                });
            }
        }
        mutate(pipeline);
        pipeline.revision = self.revision.fetch_add(1, Ordering::SeqCst);
        let event = WatchEvent::Put {
            key: name.to_string(),
            version: pipeline.version,
            revision: pipeline.revision,
        };
        drop(guard);
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// An in-memory mutual-exclusion lock: two [`InMemoryLock`] handles cloned
/// from the same [`InMemoryLock::new`] contend for the same underlying
/// mutex, for leader-safety tests.
#[derive(Clone)]
pub struct InMemoryLock {
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, parent: CancellationToken) -> Result<LockSession, Error> {
        let mutex = self.mutex.clone();
        let guard = tokio::select! {
            _ = parent.cancelled() => return Err(Error::LockLost),
            guard = mutex.clone().lock_owned() => guard,
        };
        let cancellation = CancellationToken::new();
        let child = cancellation.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child.cancel();
        });
        let held = Arc::new(Mutex::new(Some(guard)));
        Ok(LockSession::new(cancellation, move || {
            held.lock().take();
        }))
    }
}

// `Error` isn't `Clone` (it wraps `etcd_client`/`kube` error types), and
// `broadcast::Sender` requires its value to be. Carry injected failures
// as a plain message and rebuild the `Error` for each receiver instead.
#[derive(Clone)]
enum InjectedPodEvent {
    Applied(PodEvent),
    Error(String),
}

/// An in-memory [`ContainerOrchestrator`]. Workloads are tracked as plain
/// `(Workload, ready)` pairs; pod events are injected by tests through
/// [`InMemoryOrchestrator::inject_pod_event`] / [`InMemoryOrchestrator::inject_pod_error`].
#[derive(Clone)]
pub struct InMemoryOrchestrator {
    workloads: Arc<Mutex<HashMap<String, (Workload, bool)>>>,
    services: Arc<Mutex<HashSet<String>>>,
    pod_tx: Arc<broadcast::Sender<InjectedPodEvent>>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        let (pod_tx, _rx) = broadcast::channel(1024);
        Self {
            workloads: Arc::new(Mutex::new(HashMap::new())),
            services: Arc::new(Mutex::new(HashSet::new())),
            pod_tx: Arc::new(pod_tx),
        }
    }

    pub fn inject_pod_event(&self, event: PodEvent) {
        let _ = self.pod_tx.send(InjectedPodEvent::Applied(event));
    }

    pub fn inject_pod_error(&self) {
        let _ = self
            .pod_tx
            .send(InjectedPodEvent::Error("simulated pod watch error".into()));
    }

    pub fn set_ready(&self, pipeline_name: &str, ready: bool) {
        if let Some(entry) = self.workloads.lock().get_mut(pipeline_name) {
            entry.1 = ready;
        }
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.lock().len()
    }

    pub fn has_workload(&self, pipeline_name: &str) -> bool {
        self.workloads.lock().contains_key(pipeline_name)
    }
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerOrchestrator for InMemoryOrchestrator {
    async fn list_services(&self, _pipeline_name: &str) -> Result<Vec<String>, Error> {
        Ok(self.services.lock().iter().cloned().collect())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        self.services.lock().remove(name);
        Ok(())
    }

    async fn list_replication_controllers(&self, pipeline_name: &str) -> Result<Vec<String>, Error> {
        Ok(if self.workloads.lock().contains_key(pipeline_name) {
            vec![format!("pipeline-{pipeline_name}-v")]
        } else {
            vec![]
        })
    }

    async fn delete_rc(&self, name: &str) -> Result<(), Error> {
        let pipeline_name = name.trim_start_matches("pipeline-").trim_end_matches("-v");
        self.workloads.lock().remove(pipeline_name);
        Ok(())
    }

    async fn scale_rc(&self, name: &str, replicas: i32) -> Result<(), Error> {
        let pipeline_name = name.trim_start_matches("pipeline-").trim_end_matches("-v").to_string();
        if let Some((workload, _)) = self.workloads.lock().get_mut(&pipeline_name) {
            workload.replicas = replicas;
        }
        Ok(())
    }

    async fn current_spec_commit(&self, pipeline_name: &str) -> Result<Option<String>, Error> {
        Ok(self
            .workloads
            .lock()
            .get(pipeline_name)
            .map(|(w, _)| w.spec_commit.clone()))
    }

    async fn ensure_workload(&self, workload: &Workload) -> Result<(), Error> {
        self.workloads
            .lock()
            .insert(workload.pipeline_name.clone(), (workload.clone(), false));
        Ok(())
    }

    async fn workload_ready(&self, pipeline_name: &str) -> Result<bool, Error> {
        Ok(self
            .workloads
            .lock()
            .get(pipeline_name)
            .map(|(_, ready)| *ready)
            .unwrap_or(false))
    }

    async fn watch_pods(&self) -> Result<PodStream, Error> {
        let rx = self.pod_tx.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(InjectedPodEvent::Applied(event)) => Some(Ok(event)),
                Ok(InjectedPodEvent::Error(msg)) => Some(Err(Error::TransientDataStore(msg))),
                Err(_lagged) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}

/// An in-memory [`DataStore`] modeling just enough of the content-addressed
/// repo/commit/file model for the cron driver and standby monitor:
/// per-branch commit history with carry-forward file snapshots.
#[derive(Clone)]
pub struct InMemoryDataStore {
    repos: Arc<Mutex<HashMap<(String, String), Vec<CommitRecord>>>>,
    jobs: Arc<Mutex<HashSet<(String, String)>>>,
    commit_tx: Arc<broadcast::Sender<CommitInfo>>,
    notify: Arc<Notify>,
    next_id: Arc<AtomicU64>,
}

#[derive(Clone, Debug)]
struct CommitRecord {
    id: String,
    finished: Option<chrono::DateTime<Utc>>,
    files: HashSet<String>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        let (commit_tx, _rx) = broadcast::channel(1024);
        Self {
            repos: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(HashSet::new())),
            commit_tx: Arc::new(commit_tx),
            notify: Arc::new(Notify::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn mark_job_exists(&self, repo: &str, id: &str) {
        self.jobs.lock().insert((repo.to_string(), id.to_string()));
        self.notify.notify_waiters();
    }

    fn branch_key(repo: &str, branch: &str) -> (String, String) {
        (repo.to_string(), branch.to_string())
    }

    fn gen_id(&self) -> String {
        format!("commit-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn subscribe_commits(
        &self,
        repo: &str,
        _branch: &str,
        _provenance: Option<&CommitRef>,
        _from_commit: Option<&str>,
        _state: CommitState,
    ) -> Result<CommitStream, Error> {
        let rx = self.commit_tx.subscribe();
        let repo = repo.to_string();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| {
            let repo = repo.clone();
            async move {
                match res {
                    Ok(ci) if ci.commit.repo == repo => Some(Ok(ci)),
                    _ => None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn block_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, Error> {
        loop {
            {
                let repos = self.repos.lock();
                for records in repos.values() {
                    if let Some(record) = records.iter().find(|r| r.id == id) {
                        if record.finished.is_some() {
                            return Ok(CommitInfo {
                                commit: CommitRef {
                                    repo: repo.to_string(),
                                    id: id.to_string(),
                                },
                                finished: record.finished,
                            });
                        }
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    async fn inspect_job_output_commit(&self, repo: &str, id: &str, block: bool) -> Result<(), Error> {
        loop {
            if self.jobs.lock().contains(&(repo.to_string(), id.to_string())) {
                return Ok(());
            }
            if !block {
                return Err(Error::NotFound);
            }
            self.notify.notified().await;
        }
    }

    async fn list_file(&self, repo: &str, branch: &str, _path: &str) -> Result<Vec<FileInfo>, Error> {
        let repos = self.repos.lock();
        let Some(records) = repos.get(&Self::branch_key(repo, branch)) else {
            return Ok(Vec::new());
        };
        let Some(latest_finished) = records.iter().rev().find(|r| r.finished.is_some()) else {
            return Ok(Vec::new());
        };
        let mut files: Vec<FileInfo> = latest_finished
            .files
            .iter()
            .cloned()
            .map(|path| FileInfo { path })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn inspect_commit(&self, repo: &str, branch_or_id: &str) -> Result<Option<CommitInfo>, Error> {
        let repos = self.repos.lock();
        if let Some(records) = repos.get(&Self::branch_key(repo, branch_or_id)) {
            if let Some(head) = records.last() {
                return Ok(Some(CommitInfo {
                    commit: CommitRef {
                        repo: repo.to_string(),
                        id: head.id.clone(),
                    },
                    finished: head.finished,
                }));
            }
        }
        for records in repos.values() {
            if let Some(record) = records.iter().find(|r| r.id == branch_or_id) {
                return Ok(Some(CommitInfo {
                    commit: CommitRef {
                        repo: repo.to_string(),
                        id: record.id.clone(),
                    },
                    finished: record.finished,
                }));
            }
        }
        Ok(None)
    }

    async fn delete_commit(&self, repo: &str, id: &str) -> Result<(), Error> {
        let mut repos = self.repos.lock();
        for records in repos.values_mut() {
            records.retain(|r| r.id != id);
        }
        let _ = repo;
        Ok(())
    }

    async fn start_commit(&self, repo: &str, branch: &str) -> Result<CommitInfo, Error> {
        let id = self.gen_id();
        let inherited_files = {
            let repos = self.repos.lock();
            repos
                .get(&Self::branch_key(repo, branch))
                .and_then(|records| records.iter().rev().find(|r| r.finished.is_some()))
                .map(|r| r.files.clone())
                .unwrap_or_default()
        };
        let record = CommitRecord {
            id: id.clone(),
            finished: None,
            files: inherited_files,
        };
        self.repos
            .lock()
            .entry(Self::branch_key(repo, branch))
            .or_default()
            .push(record);
        let info = CommitInfo {
            commit: CommitRef {
                repo: repo.to_string(),
                id: id.clone(),
            },
            finished: None,
        };
        let _ = self.commit_tx.send(info.clone());
        Ok(info)
    }

    async fn delete_file(&self, repo: &str, branch: &str, path: &str) -> Result<(), Error> {
        let mut repos = self.repos.lock();
        let Some(records) = repos.get_mut(&Self::branch_key(repo, branch)) else {
            return Err(Error::NotFound);
        };
        let Some(head) = records.last_mut().filter(|r| r.finished.is_none()) else {
            return Err(Error::NotFound);
        };
        if path.is_empty() {
            head.files.clear();
        } else {
            head.files.remove(path);
        }
        Ok(())
    }

    async fn put_file(&self, repo: &str, branch: &str, path: &str, _contents: &[u8]) -> Result<(), Error> {
        let mut repos = self.repos.lock();
        let records = repos.entry(Self::branch_key(repo, branch)).or_default();
        let Some(head) = records.last_mut().filter(|r| r.finished.is_none()) else {
            return Err(Error::NotFound);
        };
        head.files.insert(path.to_string());
        Ok(())
    }

    async fn finish_commit(&self, repo: &str, branch: &str) -> Result<(), Error> {
        let mut repos = self.repos.lock();
        let Some(records) = repos.get_mut(&Self::branch_key(repo, branch)) else {
            return Err(Error::NotFound);
        };
        let Some(head) = records.last_mut().filter(|r| r.finished.is_none()) else {
            return Err(Error::NotFound);
        };
        head.finished = Some(Utc::now());
        drop(repos);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pps_types::{AtomInput, Input};

    use super::*;

    fn pipeline(name: &str, state: PipelineState) -> Pipeline {
        Pipeline {
            name: name.into(),
            spec_commit: "c1".into(),
            input: Input::Atom(AtomInput {
                repo: "in".into(),
                branch: "master".into(),
                glob: "/*".into(),
            }),
            standby: false,
            state,
            reason: String::new(),
            version: 1,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_a_mismatched_expected_state() {
        let store = InMemoryStore::new();
        store.put(pipeline("p1", PipelineState::Running));

        let err = store
            .compare_and_swap("p1", Some(PipelineState::Standby), &mut |p| p.state = PipelineState::Crashing)
            .await
            .unwrap_err();

        match err {
            CasError::Transition { current } => assert_eq!(current, PipelineState::Running),
            CasError::Store(e) => panic!("unexpected store error: {e}"),
        }
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Running);
    }

    #[tokio::test]
    async fn compare_and_swap_applies_the_mutation_on_a_matching_expected_state() {
        let store = InMemoryStore::new();
        store.put(pipeline("p1", PipelineState::Running));

        store
            .compare_and_swap("p1", Some(PipelineState::Running), &mut |p| p.state = PipelineState::Standby)
            .await
            .unwrap();

        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Standby);
    }

    #[tokio::test]
    async fn two_handles_to_the_same_lock_never_hold_it_concurrently() {
        let lock = InMemoryLock::new();
        let shutdown = CancellationToken::new();

        let first = lock.acquire(shutdown.clone()).await.unwrap();

        let second_lock = lock.clone();
        let second_shutdown = shutdown.clone();
        let second = tokio::spawn(async move { second_lock.acquire(second_shutdown).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second acquire must block while the first session is held");

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second acquire should complete once the first is released")
            .unwrap()
            .unwrap();
        drop(second);
    }
}
