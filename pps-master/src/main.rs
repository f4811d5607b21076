//! Entry point: reads configuration from the environment, wires the
//! etcd-backed store/lock and the Kubernetes orchestrator into
//! `pps-runtime`'s master loop, and runs until a termination signal
//! arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pps_client::{EtcdLock, EtcdStore, K8sOrchestrator};
use pps_runtime::MasterConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::from_env()?;
    init_tracing(&config.log_format);

    info!(namespace = %config.namespace, prefix = %config.etcd_prefix, "starting pipeline master");

    let etcd = etcd_client::Client::connect(config.etcd_endpoints.clone(), None)
        .await
        .context("connecting to etcd")?;
    let kube_client = kube::Client::try_default().await.context("building Kubernetes client")?;

    let store: Arc<dyn pps_client::DesiredStateStore> = Arc::new(EtcdStore::new(etcd.clone(), config.etcd_prefix.clone()));
    let lock: Arc<dyn pps_client::DistributedLock> = Arc::new(EtcdLock::new(
        etcd.clone(),
        format!("{}/master-lock", config.etcd_prefix),
        config.lock_ttl_secs,
    ));
    let orchestrator: Arc<dyn pps_client::ContainerOrchestrator> =
        Arc::new(K8sOrchestrator::new(kube_client, config.namespace.clone()));

    // A production content-addressed store adapter talks to the separate
    // pfs service over its own RPC surface; wiring that is future work, so
    // the master runs today against the in-process double.
    let data_store: Arc<dyn pps_client::DataStore> = Arc::new(pps_client::testing::InMemoryDataStore::new());

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal_shutdown.cancel();
    });

    let master_config = MasterConfig {
        crashing_poll_interval: Duration::from_secs(config.crashing_poll_interval_secs),
    };

    pps_runtime::run_master(store, lock, orchestrator, data_store, master_config, shutdown).await;
    Ok(())
}

fn init_tracing(log_format: &config::LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    match log_format {
        config::LogFormat::Json => subscriber.json().init(),
        config::LogFormat::Text => subscriber.init(),
    }
}
