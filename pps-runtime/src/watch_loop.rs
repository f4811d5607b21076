//! One `select!` loop driving both the pipeline spec watch and the
//! worker pod watch: spec events dispatch the reconciler by name; pod
//! events that carry a fatal waiting reason flip their pipeline straight
//! to CRASHING.

use std::sync::Arc;

use futures::StreamExt;
use pps_client::{ContainerOrchestrator, DesiredStateStore, PodEvent, PodStream};
use pps_types::{is_fatal_pod_reason, PipelineState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reconciler::Reconciler;
use crate::state;

/// Runs until `cancellation` fires or the pipeline watch itself fails —
/// that failure propagates so the leader-election wrapper restarts the
/// whole loop (and re-acquires the lock) rather than limping on with a
/// stale view of pipeline state. Pod-watch failure is not fatal: it's
/// logged and the watch is reopened.
pub async fn run_watch_loop(
    store: Arc<dyn DesiredStateStore>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    reconciler: Arc<Reconciler>,
    cancellation: CancellationToken,
) -> Result<(), pps_client::Error> {
    let mut spec_stream = store.watch().await?;
    let mut pod_stream = open_pod_watch(&orchestrator).await;

    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Ok(()),

            spec_event = spec_stream.next() => {
                match spec_event {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(event)) => {
                        let name = event.key().to_string();
                        let revision = event.revision();
                        let reconciler = reconciler.clone();
                        tokio::spawn(async move {
                            reconciler.step(&name, Some(revision)).await;
                        });
                    }
                }
            }

            pod_item = next_pod_event(&mut pod_stream) => {
                match pod_item {
                    Some(Ok(event)) => handle_pod_event(&store, &event).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "pod watch errored, reconnecting");
                        pod_stream = open_pod_watch(&orchestrator).await;
                    }
                    None => {
                        warn!("pod watch stream ended, reconnecting");
                        pod_stream = open_pod_watch(&orchestrator).await;
                    }
                }
            }
        }
    }
}

async fn open_pod_watch(orchestrator: &Arc<dyn ContainerOrchestrator>) -> Option<PodStream> {
    match orchestrator.watch_pods().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "failed to open pod watch, continuing without it");
            None
        }
    }
}

async fn next_pod_event(stream: &mut Option<PodStream>) -> Option<Result<PodEvent, pps_client::Error>> {
    match stream {
        Some(s) => s.next().await,
        None => futures::future::pending().await,
    }
}

async fn handle_pod_event(store: &Arc<dyn DesiredStateStore>, event: &PodEvent) {
    let Some(pipeline_name) = event.pod.pipeline_name.clone() else {
        return;
    };

    if event.pod.phase.as_deref() == Some("Failed") {
        warn!(pipeline = %pipeline_name, message = ?event.pod.phase_message, "worker pod failed");
    }

    let fatal = event
        .pod
        .waiting
        .iter()
        .chain(event.pod.unscheduled.iter())
        .find(|c| is_fatal_pod_reason(&c.reason));

    if let Some(condition) = fatal {
        match state::set(store.as_ref(), &pipeline_name, PipelineState::Crashing, condition.message.clone()).await {
            Ok(()) => info!(pipeline = %pipeline_name, reason = %condition.reason, "pipeline marked crashing"),
            Err(e) => warn!(pipeline = %pipeline_name, error = %e, "failed to mark pipeline crashing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pps_client::testing::{InMemoryDataStore, InMemoryOrchestrator, InMemoryStore};
    use pps_client::{PodCondition, PodEventKind, PodView};
    use pps_types::{AtomInput, Input, Pipeline};

    use crate::monitors::MonitorRegistry;
    use crate::reconciler::Reconciler;

    fn pipeline(name: &str) -> Pipeline {
        Pipeline {
            name: name.into(),
            spec_commit: "c1".into(),
            input: Input::Atom(AtomInput {
                repo: "in".into(),
                branch: "master".into(),
                glob: "/*".into(),
            }),
            standby: false,
            state: PipelineState::Running,
            reason: String::new(),
            version: 1,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn fatal_waiting_reason_marks_pipeline_crashing() {
        let store = Arc::new(InMemoryStore::new());
        store.put(pipeline("p1"));

        handle_pod_event(
            &(store.clone() as Arc<dyn DesiredStateStore>),
            &PodEvent {
                kind: PodEventKind::Applied,
                pod: PodView {
                    name: "pipeline-p1-v-abc".into(),
                    pipeline_name: Some("p1".into()),
                    phase: Some("Pending".into()),
                    phase_message: None,
                    waiting: vec![PodCondition {
                        reason: "ErrImagePull".into(),
                        message: "boom".into(),
                    }],
                    unscheduled: vec![],
                },
            },
        )
        .await;

        let p = store.snapshot("p1").unwrap();
        assert_eq!(p.state, PipelineState::Crashing);
        assert_eq!(p.reason, "boom");
    }

    #[tokio::test]
    async fn non_fatal_waiting_reason_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        store.put(pipeline("p1"));

        handle_pod_event(
            &(store.clone() as Arc<dyn DesiredStateStore>),
            &PodEvent {
                kind: PodEventKind::Applied,
                pod: PodView {
                    name: "pipeline-p1-v-abc".into(),
                    pipeline_name: Some("p1".into()),
                    phase: Some("Pending".into()),
                    phase_message: None,
                    waiting: vec![PodCondition {
                        reason: "ContainerCreating".into(),
                        message: String::new(),
                    }],
                    unscheduled: vec![],
                },
            },
        )
        .await;

        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Running);
    }

    #[tokio::test]
    async fn pod_watch_error_is_recovered_by_reopening_the_watch() {
        let store = Arc::new(InMemoryStore::new());
        store.put(pipeline("p1"));
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        let data_store = Arc::new(InMemoryDataStore::new());
        let monitors = MonitorRegistry::new();
        let reconciler = Reconciler::new(store.clone(), orchestrator.clone(), data_store, monitors, Duration::from_millis(10));

        let cancellation = CancellationToken::new();
        let handle = tokio::spawn(run_watch_loop(store.clone(), orchestrator.clone(), reconciler, cancellation.clone()));

        // A pod-watch error must not kill the loop: it reopens the watch and
        // keeps handling subsequent pod events.
        orchestrator.inject_pod_error();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Running, "an errored pod watch must not itself change pipeline state");

        orchestrator.inject_pod_event(PodEvent {
            kind: PodEventKind::Applied,
            pod: PodView {
                name: "pipeline-p1-v-abc".into(),
                pipeline_name: Some("p1".into()),
                phase: Some("Pending".into()),
                phase_message: None,
                waiting: vec![PodCondition {
                    reason: "ErrImagePull".into(),
                    message: "boom".into(),
                }],
                unscheduled: vec![],
            },
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Crashing, "watch should have reopened after the injected error and delivered this event");

        cancellation.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watch loop should exit promptly on cancellation")
            .unwrap()
            .unwrap();
    }
}
