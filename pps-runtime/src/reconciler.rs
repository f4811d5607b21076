//! The per-pipeline reconcile step: reads the authoritative pipeline
//! record, converges the orchestrator's workload to match it, flips
//! STARTING to RUNNING on readiness, and installs the monitor tasks the
//! pipeline's current spec and state call for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pps_client::{ContainerOrchestrator, DataStore, DesiredStateStore, Workload};
use pps_types::{Pipeline, PipelineKey, PipelineState};
use tracing::{info, warn};

use crate::monitors::{MonitorMap, MonitorRegistry};
use crate::state::{self, TransitionError};
use crate::{crashing, cron, standby};

/// Owns the collaborators and the per-pipeline serialization locks that
/// back [`Reconciler::step`].
pub struct Reconciler {
    store: Arc<dyn DesiredStateStore>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    data_store: Arc<dyn DataStore>,
    monitors: Arc<MonitorRegistry>,
    locks: Mutex<HashMap<PipelineKey, Arc<tokio::sync::Mutex<()>>>>,
    crashing_poll_interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn DesiredStateStore>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        data_store: Arc<dyn DataStore>,
        monitors: Arc<MonitorRegistry>,
        crashing_poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            orchestrator,
            data_store,
            monitors,
            locks: Mutex::new(HashMap::new()),
            crashing_poll_interval,
        })
    }

    fn pipeline_lock(&self, name: &PipelineKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Entry point: `step(pipeline_name, revision)`. Idempotent and safe
    /// to call with the same or a stale revision; actions for a given
    /// pipeline never overlap with each other.
    pub async fn step(self: &Arc<Self>, pipeline_name: &str, min_revision: Option<i64>) {
        let key = PipelineKey::from(pipeline_name);
        let lock = self.pipeline_lock(&key);
        let _guard = lock.lock().await;

        if let Err(e) = self.step_inner(pipeline_name, min_revision).await {
            warn!(pipeline = %pipeline_name, error = %e, "reconcile step failed, will retry on next event");
        }
    }

    async fn step_inner(self: &Arc<Self>, pipeline_name: &str, min_revision: Option<i64>) -> Result<(), pps_client::Error> {
        let key = PipelineKey::from(pipeline_name);
        let pipeline = self.store.get(pipeline_name, min_revision).await?;

        let Some(pipeline) = pipeline else {
            self.delete_workloads(pipeline_name).await?;
            self.monitors.cancel_pipeline(&key);
            return Ok(());
        };

        match pipeline.state {
            PipelineState::Paused => {
                self.scale_to_zero(pipeline_name).await?;
                self.monitors.cancel_pipeline(&key);
                return Ok(());
            }
            PipelineState::Failure => {
                self.delete_workloads(pipeline_name).await?;
                self.monitors.cancel_pipeline(&key);
                return Ok(());
            }
            _ => {}
        }

        self.reconcile_workload(&pipeline).await?;
        self.refresh_monitors(&pipeline);
        Ok(())
    }

    async fn delete_workloads(&self, pipeline_name: &str) -> Result<(), pps_client::Error> {
        for service in self.orchestrator.list_services(pipeline_name).await? {
            self.orchestrator.delete_service(&service).await?;
        }
        for rc in self.orchestrator.list_replication_controllers(pipeline_name).await? {
            self.orchestrator.delete_rc(&rc).await?;
        }
        Ok(())
    }

    async fn scale_to_zero(&self, pipeline_name: &str) -> Result<(), pps_client::Error> {
        for rc in self.orchestrator.list_replication_controllers(pipeline_name).await? {
            self.orchestrator.scale_rc(&rc, 0).await?;
        }
        Ok(())
    }

    async fn reconcile_workload(&self, pipeline: &Pipeline) -> Result<(), pps_client::Error> {
        let current_commit = self.orchestrator.current_spec_commit(&pipeline.name).await?;
        if current_commit.as_deref() != Some(pipeline.spec_commit.as_str()) {
            let workload = Workload {
                pipeline_name: pipeline.name.clone(),
                spec_commit: pipeline.spec_commit.clone(),
                image: workload_image(&pipeline.name, &pipeline.spec_commit),
                replicas: 1,
            };
            self.orchestrator.ensure_workload(&workload).await?;
        }

        if pipeline.state == PipelineState::Starting && self.orchestrator.workload_ready(&pipeline.name).await? {
            match state::transition(&*self.store, &pipeline.name, PipelineState::Starting, PipelineState::Running, "workers ready").await {
                Ok(()) => info!(pipeline = %pipeline.name, "workers ready, pipeline running"),
                Err(TransitionError::Transition(e)) => {
                    info!(pipeline = %pipeline.name, current = %e.current, "pipeline moved on before STARTING->RUNNING could land");
                }
                Err(TransitionError::Client(e)) => return Err(e),
            }
        }
        Ok(())
    }

    fn refresh_monitors(self: &Arc<Self>, pipeline: &Pipeline) {
        let key = PipelineKey::from(pipeline.name.as_str());

        if pipeline.standby {
            let store = self.store.clone();
            let data_store = self.data_store.clone();
            let name = pipeline.name.clone();
            let output_repo = pipeline.name.clone();
            let spec_commit = pipeline.spec_commit.clone();
            self.monitors.start(MonitorMap::Monitor, key.clone(), move |cancellation| async move {
                standby::run_standby_monitor(store, data_store, name, output_repo, spec_commit, cancellation).await;
            });
        } else {
            self.monitors.cancel(MonitorMap::Monitor, &key);
        }

        let mut current_cron_keys = Vec::new();
        for cron_input in pipeline.cron_inputs() {
            let cron_key = key.namespaced(&format!("cron/{}", cron_input.name));
            current_cron_keys.push(cron_key.clone());
            let data_store = self.data_store.clone();
            let cron_input = cron_input.clone();
            self.monitors.start(MonitorMap::Monitor, cron_key, move |cancellation| async move {
                cron::run_cron_driver(data_store, cron_input, cancellation).await;
            });
        }
        for stale_key in self.monitors.cron_keys_for(&key) {
            if !current_cron_keys.contains(&stale_key) {
                self.monitors.cancel(MonitorMap::Monitor, &stale_key);
            }
        }

        if pipeline.state == PipelineState::Crashing {
            let store = self.store.clone();
            let orchestrator = self.orchestrator.clone();
            let name = pipeline.name.clone();
            let interval = self.crashing_poll_interval;
            self.monitors.start(MonitorMap::Crashing, key.clone(), move |cancellation| async move {
                crashing::run_crashing_monitor(store, orchestrator, name, interval, cancellation).await;
            });
        } else {
            self.monitors.cancel(MonitorMap::Crashing, &key);
        }
    }
}

fn workload_image(pipeline_name: &str, spec_commit: &str) -> String {
    format!("pipeline-{pipeline_name}-worker:{spec_commit}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pps_client::testing::{InMemoryDataStore, InMemoryOrchestrator, InMemoryStore};
    use pps_types::{AtomInput, Input};

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

    fn cron_pipeline(name: &str, cron_names: &[&str]) -> Pipeline {
        let crons = cron_names
            .iter()
            .map(|c| {
                Input::Cron(pps_types::CronInput {
                    name: (*c).into(),
                    repo: format!("{c}-repo"),
                    spec: "* * * * *".into(),
                    start: chrono::Utc::now(),
                    overwrite: false,
                })
            })
            .collect();
        Pipeline {
            name: name.into(),
            spec_commit: "c1".into(),
            input: Input::Union(crons),
            standby: false,
            state: PipelineState::Running,
            reason: String::new(),
            version: 1,
            revision: 0,
        }
    }

    fn reconciler() -> (Arc<Reconciler>, Arc<InMemoryStore>, Arc<InMemoryOrchestrator>, Arc<MonitorRegistry>) {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        let data_store = Arc::new(InMemoryDataStore::new());
        let monitors = MonitorRegistry::new();
        let reconciler = Reconciler::new(
            store.clone(),
            orchestrator.clone(),
            data_store,
            monitors.clone(),
            Duration::from_millis(10),
        );
        (reconciler, store, orchestrator, monitors)
    }

    #[tokio::test]
    async fn creates_a_workload_for_a_new_pipeline() {
        let (reconciler, store, orchestrator, _monitors) = reconciler();
        store.put(pipeline("p1", PipelineState::Starting));

        reconciler.step("p1", None).await;

        assert!(orchestrator.has_workload("p1"));
    }

    #[tokio::test]
    async fn flips_starting_to_running_once_workload_is_ready() {
        let (reconciler, store, orchestrator, _monitors) = reconciler();
        store.put(pipeline("p1", PipelineState::Starting));
        reconciler.step("p1", None).await;

        orchestrator.set_ready("p1", true);
        reconciler.step("p1", None).await;

        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Running);
    }

    #[tokio::test]
    async fn paused_pipeline_scales_to_zero_without_deleting() {
        let (reconciler, store, orchestrator, _monitors) = reconciler();
        store.put(pipeline("p1", PipelineState::Running));
        reconciler.step("p1", None).await;
        assert!(orchestrator.has_workload("p1"));

        store.compare_and_swap("p1", None, &mut |p| p.state = PipelineState::Paused)
            .await
            .unwrap();
        reconciler.step("p1", None).await;

        assert!(orchestrator.has_workload("p1"), "scaling to zero keeps the workload, it does not delete it");
    }

    #[tokio::test]
    async fn deleted_pipeline_tears_down_its_workload() {
        let (reconciler, store, orchestrator, _monitors) = reconciler();
        store.put(pipeline("p1", PipelineState::Running));
        reconciler.step("p1", None).await;
        assert!(orchestrator.has_workload("p1"));

        store.delete("p1");
        reconciler.step("p1", None).await;

        assert!(!orchestrator.has_workload("p1"));
    }

    #[tokio::test]
    async fn removing_a_cron_input_cancels_its_driver() {
        let (reconciler, store, _orchestrator, monitors) = reconciler();
        store.put(cron_pipeline("p1", &["a", "b"]));
        reconciler.step("p1", None).await;
        assert_eq!(monitors.monitor_count(), 2, "both cron drivers should be registered");

        store
            .compare_and_swap("p1", None, &mut |p| {
                let keep = p.cron_inputs()[0].clone();
                p.input = Input::Union(vec![Input::Cron(keep)]);
            })
            .await
            .unwrap();
        reconciler.step("p1", None).await;

        assert_eq!(monitors.monitor_count(), 1, "the removed cron input's driver should be cancelled");
        let key = PipelineKey::from("p1").namespaced("cron/a");
        assert!(monitors.has(MonitorMap::Monitor, &key), "the surviving cron input keeps its driver");
    }
}
