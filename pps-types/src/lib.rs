//! Shared data model for the pipeline master: the durable [`Pipeline`]
//! record, its lifecycle [`PipelineState`], and the recursive [`Input`]
//! tree.

mod error;
mod input;
mod key;
mod pipeline;

pub use error::PipelineTransitionError;
pub use input::{AtomInput, CronInput, Input};
pub use key::PipelineKey;
pub use pipeline::{Pipeline, PipelineState};

/// Label applied to every workload controller and pod created on a
/// pipeline's behalf, matching the orchestrator selector the Pod Watcher
/// uses (`component=worker`) plus `pipelineName=<name>`.
pub const PIPELINE_NAME_LABEL: &str = "pipelineName";

/// Label selector value used by the Pod Watcher and by workload creation.
pub const WORKER_COMPONENT_LABEL: &str = "component";

/// Worker component label value.
pub const WORKER_COMPONENT_VALUE: &str = "worker";

/// Name of the system-reserved repo holding one commit per pipeline spec
/// version. The standby monitor scopes its output-commit subscription to
/// provenance on this repo at the pipeline's current `spec_commit`, so a
/// commit caused by an older spec version doesn't wake the pipeline back
/// up from standby under its current one.
pub const SPEC_REPO: &str = "__spec__";

/// Container/pod waiting reasons that are considered fatal and drive a
/// pipeline into [`PipelineState::Crashing`]. Bit-exact, case-sensitive.
pub const FATAL_POD_REASONS: [&str; 3] = ["InvalidImageName", "ErrImagePull", "Unschedulable"];

/// True if `reason` is one of [`FATAL_POD_REASONS`].
pub fn is_fatal_pod_reason(reason: &str) -> bool {
    FATAL_POD_REASONS.contains(&reason)
}
