//! Top-level wiring: takes the four collaborator trait objects and ties
//! leader election, the monitor registry and the watch/reconcile loop
//! into one long-running task.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use pps_client::{ContainerOrchestrator, DataStore, DesiredStateStore, DistributedLock};
use tokio_util::sync::CancellationToken;

use crate::election::{self, MainLoop, RunError};
use crate::monitors::MonitorRegistry;
use crate::reconciler::Reconciler;
use crate::watch_loop;

/// Tunables that aren't part of a pipeline's own spec.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// How often the Crashing Monitor polls orchestrator readiness.
    pub crashing_poll_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            crashing_poll_interval: Duration::from_secs(10),
        }
    }
}

/// Runs forever (until `shutdown` fires): acquires the master lock,
/// drives the combined watch loop, and releases the lock and drains all
/// monitors on every retry, per [`election::run_with_leader_election`].
pub async fn run_master(
    store: Arc<dyn DesiredStateStore>,
    lock: Arc<dyn DistributedLock>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    data_store: Arc<dyn DataStore>,
    config: MasterConfig,
    shutdown: CancellationToken,
) {
    let monitors = MonitorRegistry::new();
    let reconciler = Reconciler::new(
        store.clone(),
        orchestrator.clone(),
        data_store,
        monitors.clone(),
        config.crashing_poll_interval,
    );

    let main_loop: Arc<MainLoop> = {
        let store = store.clone();
        let orchestrator = orchestrator.clone();
        Arc::new(move |cancellation: CancellationToken| {
            let store = store.clone();
            let orchestrator = orchestrator.clone();
            let reconciler = reconciler.clone();
            Box::pin(async move {
                watch_loop::run_watch_loop(store, orchestrator, reconciler, cancellation)
                    .await
                    .map_err(RunError::Client)
            }) as BoxFuture<'static, Result<(), RunError>>
        })
    };

    election::run_with_leader_election(lock, monitors, shutdown, main_loop).await;
}
