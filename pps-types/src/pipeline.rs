use serde::{Deserialize, Serialize};

use crate::input::Input;

/// Lifecycle state of a [`Pipeline`].
///
/// `Failure` is terminal within a `version`. `Paused` is externally
/// imposed and is sticky against the master: nothing in this crate's
/// reconciliation or monitor logic is allowed to transition a pipeline
/// *out* of `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Starting,
    Running,
    Standby,
    Paused,
    Crashing,
    Failure,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Starting => "STARTING",
            PipelineState::Running => "RUNNING",
            PipelineState::Standby => "STANDBY",
            PipelineState::Paused => "PAUSED",
            PipelineState::Crashing => "CRASHING",
            PipelineState::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Durable pipeline record as read from the desired-state store.
///
/// This is the authoritative shape the reconciler re-reads on every event;
/// it never trusts a watch event's payload over a fresh read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub spec_commit: String,
    pub input: Input,
    pub standby: bool,
    pub state: PipelineState,
    #[serde(default)]
    pub reason: String,
    pub version: u64,
    /// Store-assigned revision; not serialized as part of the value, but
    /// carried alongside it once read back (see `pps_client::store`).
    #[serde(skip)]
    pub revision: i64,
}

impl Pipeline {
    /// Every cron-typed leaf of this pipeline's input tree, depth-first.
    pub fn cron_inputs(&self) -> Vec<&crate::input::CronInput> {
        let mut out = Vec::new();
        self.input.visit_crons(&mut |c| out.push(c));
        out
    }
}
