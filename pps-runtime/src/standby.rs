//! Scales a pipeline's workers down to zero while it has no pending
//! input, and back up for as long as input keeps arriving.

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use pps_client::{CommitInfo, CommitRef, CommitState, CommitStream, DataStore, DesiredStateStore};
use pps_types::{PipelineState, SPEC_REPO};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::{self, TransitionError};

enum CycleOutcome {
    Continue,
    Exit,
}

enum StepOutcome {
    Done,
    Cancelled,
}

/// Runs until `cancellation` fires or the pipeline leaves the
/// standby-eligible RUNNING/STANDBY pair of states (a paused, crashing or
/// deleted pipeline are all someone else's problem: the reconciler will
/// have already cancelled this task through the monitor registry by the
/// time that matters, but a lost CAS race is handled gracefully too).
pub async fn run_standby_monitor(
    store: Arc<dyn DesiredStateStore>,
    data_store: Arc<dyn DataStore>,
    pipeline_name: String,
    output_repo: String,
    spec_commit: String,
    cancellation: CancellationToken,
) {
    let mut backoff_policy = ExponentialBackoff::default();
    loop {
        if cancellation.is_cancelled() {
            return;
        }
        match cycle(&*store, &*data_store, &pipeline_name, &output_repo, &spec_commit, &cancellation).await {
            Ok(CycleOutcome::Continue) => backoff_policy.reset(),
            Ok(CycleOutcome::Exit) => {
                info!(pipeline = %pipeline_name, "standby monitor exiting");
                return;
            }
            Err(e) => {
                warn!(pipeline = %pipeline_name, error = %e, "standby monitor store error, retrying after backoff");
                let delay = backoff_policy
                    .next_backoff()
                    .unwrap_or(std::time::Duration::from_secs(60));
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn cycle(
    store: &dyn DesiredStateStore,
    data_store: &dyn DataStore,
    pipeline_name: &str,
    output_repo: &str,
    spec_commit: &str,
    cancellation: &CancellationToken,
) -> Result<CycleOutcome, pps_client::Error> {
    match state::transition(store, pipeline_name, PipelineState::Running, PipelineState::Standby, "no pending input").await {
        Ok(()) => {}
        Err(TransitionError::Transition(_)) => return Ok(CycleOutcome::Exit),
        Err(TransitionError::Client(e)) => return Err(e),
    }

    let provenance = CommitRef {
        repo: SPEC_REPO.to_string(),
        id: spec_commit.to_string(),
    };
    let mut stream = data_store
        .subscribe_commits(output_repo, "master", Some(&provenance), None, CommitState::Ready)
        .await?;

    let first = match wait_for_commit(&mut stream, cancellation).await? {
        Some(info) => info,
        None => return Ok(CycleOutcome::Exit),
    };

    match state::transition(store, pipeline_name, PipelineState::Standby, PipelineState::Running, "new input arrived").await {
        Ok(()) => {}
        Err(TransitionError::Transition(_)) => return Ok(CycleOutcome::Exit),
        Err(TransitionError::Client(e)) => return Err(e),
    }

    match drain_and_process(data_store, &mut stream, first, cancellation).await? {
        StepOutcome::Done => Ok(CycleOutcome::Continue),
        StepOutcome::Cancelled => Ok(CycleOutcome::Exit),
    }
}

/// Waits for the first commit not already finished at subscribe time, so
/// a commit that finished before we started watching doesn't immediately
/// retrigger the pipeline.
async fn wait_for_commit(
    stream: &mut CommitStream,
    cancellation: &CancellationToken,
) -> Result<Option<CommitInfo>, pps_client::Error> {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return Ok(None),
            item = stream.next() => {
                match item {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(info)) if info.finished.is_some() => continue,
                    Some(Ok(info)) => return Ok(Some(info)),
                }
            }
        }
    }
}

/// Processes `first`, then keeps pulling and processing anything already
/// queued without blocking; stops the moment the queue is empty.
async fn drain_and_process(
    data_store: &dyn DataStore,
    stream: &mut CommitStream,
    first: CommitInfo,
    cancellation: &CancellationToken,
) -> Result<StepOutcome, pps_client::Error> {
    let mut next = Some(first);
    while let Some(info) = next.take() {
        tokio::select! {
            _ = cancellation.cancelled() => return Ok(StepOutcome::Cancelled),
            res = data_store.block_commit(&info.commit.repo, &info.commit.id) => { res?; }
        }
        tokio::select! {
            _ = cancellation.cancelled() => return Ok(StepOutcome::Cancelled),
            res = data_store.inspect_job_output_commit(&info.commit.repo, &info.commit.id, true) => { res?; }
        }
        next = match tokio::time::timeout(std::time::Duration::ZERO, stream.next()).await {
            Ok(Some(Ok(info))) => Some(info),
            _ => None,
        };
    }
    Ok(StepOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pps_client::testing::{InMemoryDataStore, InMemoryStore};
    use pps_types::{AtomInput, Input, Pipeline};

    fn pipeline(name: &str) -> Pipeline {
        Pipeline {
            name: name.into(),
            spec_commit: "c1".into(),
            input: Input::Atom(AtomInput {
                repo: "in".into(),
                branch: "master".into(),
                glob: "/*".into(),
            }),
            standby: true,
            state: PipelineState::Running,
            reason: String::new(),
            version: 1,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn goes_to_standby_then_back_to_running_on_new_commit() {
        let store = Arc::new(InMemoryStore::new());
        let data_store = Arc::new(InMemoryDataStore::new());
        store.put(pipeline("p1"));

        let cancellation = CancellationToken::new();
        let handle = tokio::spawn(run_standby_monitor(
            store.clone(),
            data_store.clone(),
            "p1".into(),
            "p1".into(),
            "c1".into(),
            cancellation.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Standby);

        data_store.start_commit("p1", "master").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Running);

        data_store.finish_commit("p1", "master").await.unwrap();
        let info = data_store.inspect_commit("p1", "master").await.unwrap().unwrap();
        data_store.mark_job_exists("p1", &info.commit.id);

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Standby);

        cancellation.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn exits_cleanly_when_pipeline_is_paused() {
        let store = Arc::new(InMemoryStore::new());
        let data_store = Arc::new(InMemoryDataStore::new());
        let mut p = pipeline("p1");
        p.state = PipelineState::Paused;
        store.put(p);

        let cancellation = CancellationToken::new();
        let handle = tokio::spawn(run_standby_monitor(
            store,
            data_store,
            "p1".into(),
            "p1".into(),
            "c1".into(),
            cancellation,
        ));

        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("monitor should exit on its own")
            .unwrap();
    }
}
