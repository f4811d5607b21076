//! Polls a crashing pipeline's workload until every worker reports ready,
//! then flips the pipeline back to RUNNING.

use std::sync::Arc;
use std::time::Duration;

use pps_client::{ContainerOrchestrator, DesiredStateStore};
use pps_types::PipelineState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::{self, TransitionError};

pub async fn run_crashing_monitor(
    store: Arc<dyn DesiredStateStore>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    pipeline_name: String,
    poll_interval: Duration,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let ready = match orchestrator.workload_ready(&pipeline_name).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(pipeline = %pipeline_name, error = %e, "crashing monitor failed to poll workload readiness");
                continue;
            }
        };
        if !ready {
            continue;
        }

        match state::transition(&*store, &pipeline_name, PipelineState::Crashing, PipelineState::Running, "all workers ready").await {
            Ok(()) => {
                info!(pipeline = %pipeline_name, "all workers ready, recovered from crashing");
                return;
            }
            Err(TransitionError::Transition(e)) => {
                info!(pipeline = %pipeline_name, current = %e.current, "pipeline no longer crashing, crashing monitor exiting");
                return;
            }
            Err(TransitionError::Client(e)) => {
                warn!(pipeline = %pipeline_name, error = %e, "crashing monitor store error, will poll again");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pps_client::testing::{InMemoryOrchestrator, InMemoryStore};
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
            standby: false,
            state: PipelineState::Crashing,
            reason: "ErrImagePull".into(),
            version: 1,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn recovers_once_workload_becomes_ready() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        store.put(pipeline("p1"));
        orchestrator
            .ensure_workload(&pps_client::Workload {
                pipeline_name: "p1".into(),
                spec_commit: "c1".into(),
                image: "img".into(),
                replicas: 1,
            })
            .await
            .unwrap();

        let cancellation = CancellationToken::new();
        let handle = tokio::spawn(run_crashing_monitor(
            store.clone(),
            orchestrator.clone(),
            "p1".into(),
            Duration::from_millis(10),
            cancellation.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Crashing);

        orchestrator.set_ready("p1", true);
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("monitor should exit once recovered")
            .unwrap();
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Running);
    }
}
