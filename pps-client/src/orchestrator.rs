use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, ReplicationController, Service};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    runtime::watcher,
    Api, Client,
};
use pps_types::{PIPELINE_NAME_LABEL, WORKER_COMPONENT_LABEL, WORKER_COMPONENT_VALUE};

use crate::error::Error;

/// A single container's or pod's waiting/scheduling reason, as read off
/// `status.containerStatuses[].state.waiting` or
/// `status.conditions[].{reason,message}`.
#[derive(Debug, Clone)]
pub struct PodCondition {
    pub reason: String,
    pub message: String,
}

/// The subset of a Kubernetes pod the pod watcher inspects.
#[derive(Debug, Clone)]
pub struct PodView {
    pub name: String,
    pub pipeline_name: Option<String>,
    pub phase: Option<String>,
    pub phase_message: Option<String>,
    pub waiting: Vec<PodCondition>,
    pub unscheduled: Vec<PodCondition>,
}

impl PodView {
    fn from_pod(pod: &Pod) -> Self {
        let annotations = pod
            .metadata
            .annotations
            .clone()
            .unwrap_or_default();
        let pipeline_name = annotations.get(PIPELINE_NAME_LABEL).cloned();
        let status = pod.status.clone().unwrap_or_default();
        let waiting = status
            .container_statuses
            .unwrap_or_default()
            .into_iter()
            .filter_map(|cs| {
                let w = cs.state?.waiting?;
                Some(PodCondition {
                    reason: w.reason.unwrap_or_default(),
                    message: w.message.unwrap_or_default(),
                })
            })
            .collect();
        let unscheduled = status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.type_ == "PodScheduled" && c.status != "True")
            .map(|c| PodCondition {
                reason: c.reason.unwrap_or_default(),
                message: c.message.unwrap_or_default(),
            })
            .collect();
        PodView {
            name: pod.metadata.name.clone().unwrap_or_default(),
            pipeline_name,
            phase: status.phase,
            phase_message: status.message,
            waiting,
            unscheduled,
        }
    }
}

/// Event kind from `watch_pods`, collapsing kube's richer `watcher::Event`
/// into the simpler applied/deleted shape the reconciler reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: PodView,
}

pub type PodStream = Pin<Box<dyn Stream<Item = Result<PodEvent, Error>> + Send>>;

/// Desired shape of a pipeline's workload controller.
#[derive(Debug, Clone)]
pub struct Workload {
    pub pipeline_name: String,
    pub spec_commit: String,
    pub image: String,
    pub replicas: i32,
}

/// The container orchestrator: creates, scales and tears down the
/// per-pipeline workload and reports on its pods.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    async fn list_services(&self, pipeline_name: &str) -> Result<Vec<String>, Error>;
    async fn delete_service(&self, name: &str) -> Result<(), Error>;

    async fn list_replication_controllers(&self, pipeline_name: &str) -> Result<Vec<String>, Error>;
    async fn delete_rc(&self, name: &str) -> Result<(), Error>;
    async fn scale_rc(&self, name: &str, replicas: i32) -> Result<(), Error>;

    /// Current spec-commit annotation of the pipeline's RC, if any exists.
    async fn current_spec_commit(&self, pipeline_name: &str) -> Result<Option<String>, Error>;
    /// Creates (or replaces) the pipeline's RC to match `workload`.
    async fn ensure_workload(&self, workload: &Workload) -> Result<(), Error>;
    /// True once the pipeline's RC reports all replicas ready.
    async fn workload_ready(&self, pipeline_name: &str) -> Result<bool, Error>;

    /// Opens a label-selected watch over `component=worker` pods. Not
    /// fatal to call: if the initial watch itself fails to start, callers
    /// should log and continue without it.
    async fn watch_pods(&self) -> Result<PodStream, Error>;
}

/// Production orchestrator backed by the real Kubernetes API.
pub struct K8sOrchestrator {
    client: Client,
    namespace: String,
}

impl K8sOrchestrator {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn selector(pipeline_name: &str) -> String {
        format!("{PIPELINE_NAME_LABEL}={pipeline_name}")
    }

    fn worker_selector() -> String {
        format!("{WORKER_COMPONENT_LABEL}={WORKER_COMPONENT_VALUE}")
    }

    fn delete_params() -> DeleteParams {
        // Non-orphaning: dependents are garbage-collected with the parent.
        DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerOrchestrator for K8sOrchestrator {
    async fn list_services(&self, pipeline_name: &str) -> Result<Vec<String>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&Self::selector(pipeline_name));
        let list = api.list(&lp).await.map_err(Error::TransientOrchestrator)?;
        Ok(list.items.into_iter().filter_map(|s| s.metadata.name).collect())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.delete(name, &Self::delete_params()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::TransientOrchestrator(e)),
        }
    }

    async fn list_replication_controllers(&self, pipeline_name: &str) -> Result<Vec<String>, Error> {
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&Self::selector(pipeline_name));
        let list = api.list(&lp).await.map_err(Error::TransientOrchestrator)?;
        Ok(list.items.into_iter().filter_map(|rc| rc.metadata.name).collect())
    }

    async fn delete_rc(&self, name: &str) -> Result<(), Error> {
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.delete(name, &Self::delete_params()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::TransientOrchestrator(e)),
        }
    }

    async fn scale_rc(&self, name: &str, replicas: i32) -> Result<(), Error> {
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::TransientOrchestrator)?;
        Ok(())
    }

    async fn current_spec_commit(&self, pipeline_name: &str) -> Result<Option<String>, Error> {
        let names = self.list_replication_controllers(pipeline_name).await?;
        let Some(name) = names.into_iter().next() else {
            return Ok(None);
        };
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), &self.namespace);
        let rc = api.get(&name).await.map_err(Error::TransientOrchestrator)?;
        Ok(rc
            .metadata
            .annotations
            .unwrap_or_default()
            .get("specCommit")
            .cloned())
    }

    async fn ensure_workload(&self, workload: &Workload) -> Result<(), Error> {
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = format!("pipeline-{}-v", workload.pipeline_name);
        let mut labels = BTreeMap::new();
        labels.insert(PIPELINE_NAME_LABEL.to_string(), workload.pipeline_name.clone());
        labels.insert(WORKER_COMPONENT_LABEL.to_string(), WORKER_COMPONENT_VALUE.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert("specCommit".to_string(), workload.spec_commit.clone());

        let rc = build_replication_controller(&name, &self.namespace, labels, annotations, workload);
        match api.create(&PostParams::default(), &rc).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                let patch = serde_json::to_value(&rc).map_err(Error::Decode)?;
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(Error::TransientOrchestrator)?;
                Ok(())
            }
            Err(e) => Err(Error::TransientOrchestrator(e)),
        }
    }

    async fn workload_ready(&self, pipeline_name: &str) -> Result<bool, Error> {
        let names = self.list_replication_controllers(pipeline_name).await?;
        let Some(name) = names.into_iter().next() else {
            return Ok(false);
        };
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), &self.namespace);
        let rc = api.get(&name).await.map_err(Error::TransientOrchestrator)?;
        let spec_replicas = rc.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let ready = rc
            .status
            .as_ref()
            .map(|s| s.ready_replicas.unwrap_or(0))
            .unwrap_or(0);
        Ok(spec_replicas > 0 && ready >= spec_replicas)
    }

    async fn watch_pods(&self) -> Result<PodStream, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let cfg = watcher::Config::default().labels(&Self::worker_selector());
        let stream = watcher::watcher(api, cfg).map(|res| match res {
            Ok(watcher::Event::Apply(pod)) => Ok(PodEvent {
                kind: PodEventKind::Applied,
                pod: PodView::from_pod(&pod),
            }),
            Ok(watcher::Event::Delete(pod)) => Ok(PodEvent {
                kind: PodEventKind::Deleted,
                pod: PodView::from_pod(&pod),
            }),
            // Relist bookkeeping events; never carry a pipeline annotation,
            // the runtime's pod-watch loop skips anything with no
            // `pipeline_name`.
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitApply(_)) | Ok(watcher::Event::InitDone) => {
                Ok(PodEvent {
                    kind: PodEventKind::Applied,
                    pod: PodView {
                        name: String::new(),
                        pipeline_name: None,
                        phase: None,
                        phase_message: None,
                        waiting: Vec::new(),
                        unscheduled: Vec::new(),
                    },
                })
            }
            Err(e) => Err(Error::TransientOrchestrator(kube::Error::Service(Box::new(e)))),
        });
        Ok(Box::pin(stream))
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

fn build_replication_controller(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    workload: &Workload,
) -> ReplicationController {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    ReplicationController {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations.clone()),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::ReplicationControllerSpec {
            replicas: Some(workload.replicas),
            selector: Some(labels.clone()),
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "worker".to_string(),
                        image: Some(workload.image.clone()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }),
        status: None,
    }
}
