use thiserror::Error;

use crate::pipeline::PipelineState;

/// A compare-and-swap state write found the pipeline in a state other than
/// the one the caller expected. Callers discriminate on `current`:
/// `Paused`/`Crashing` are graceful-exit signals, anything else propagates.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("pipeline transition failed: expected a different current state, found {current}")]
pub struct PipelineTransitionError {
    pub current: PipelineState,
}
