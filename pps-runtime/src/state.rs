//! Writes to a pipeline's lifecycle state, unconditionally or guarded by
//! a compare-and-swap against the state the caller expects to find.

use pps_client::{CasError, DesiredStateStore};
use pps_types::{Pipeline, PipelineState, PipelineTransitionError};
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error(transparent)]
    Client(#[from] pps_client::Error),
    #[error(transparent)]
    Transition(#[from] PipelineTransitionError),
}

impl From<CasError> for TransitionError {
    fn from(e: CasError) -> Self {
        match e {
            CasError::Store(err) => TransitionError::Client(err),
            CasError::Transition { current } => TransitionError::Transition(PipelineTransitionError { current }),
        }
    }
}

/// Unconditionally writes `to` and `reason`, regardless of current state.
pub async fn set(
    store: &dyn DesiredStateStore,
    name: &str,
    to: PipelineState,
    reason: impl Into<String> + Send,
) -> Result<(), TransitionError> {
    let mut reason = Some(reason.into());
    let span = tracing::info_span!("pipeline_state_set", pipeline = name, to = %to);
    async move {
        let result = store
            .compare_and_swap(name, None, &mut |p: &mut Pipeline| {
                p.state = to;
                p.reason = reason.take().unwrap_or_default();
            })
            .await;
        if let Err(e) = &result {
            tracing::warn!(error = ?e, "unconditional state write failed");
        }
        result.map_err(TransitionError::from)
    }
    .instrument(span)
    .await
}

/// Writes `to` and `reason` only if the stored state is currently `from`.
/// Fails with [`TransitionError::Transition`] carrying whatever state was
/// actually found otherwise.
pub async fn transition(
    store: &dyn DesiredStateStore,
    name: &str,
    from: PipelineState,
    to: PipelineState,
    reason: impl Into<String> + Send,
) -> Result<(), TransitionError> {
    let mut reason = Some(reason.into());
    let span = tracing::info_span!("pipeline_state_transition", pipeline = name, from = %from, to = %to);
    async move {
        let result = store
            .compare_and_swap(name, Some(from), &mut |p: &mut Pipeline| {
                p.state = to;
                p.reason = reason.take().unwrap_or_default();
            })
            .await;
        if let Err(e) = &result {
            tracing::warn!(error = ?e, "guarded state transition failed");
        }
        result.map_err(TransitionError::from)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pps_client::testing::InMemoryStore;
    use pps_types::{AtomInput, Input};

    fn pipeline(name: &str, state: PipelineState) -> Pipeline {
        Pipeline {
            name: name.into(),
            spec_commit: "c1".into(),
            input: Input::Atom(AtomInput {
                repo: "r1".into(),
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

    #[tokio::test]
    async fn set_writes_regardless_of_current_state() {
        let store = InMemoryStore::new();
        store.put(pipeline("p1", PipelineState::Starting));

        set(&store, "p1", PipelineState::Running, "became ready").await.unwrap();

        let p = store.snapshot("p1").unwrap();
        assert_eq!(p.state, PipelineState::Running);
        assert_eq!(p.reason, "became ready");
    }

    #[tokio::test]
    async fn transition_fails_when_current_state_mismatches() {
        let store = InMemoryStore::new();
        store.put(pipeline("p1", PipelineState::Paused));

        let err = transition(&store, "p1", PipelineState::Running, PipelineState::Standby, "")
            .await
            .unwrap_err();

        match err {
            TransitionError::Transition(e) => assert_eq!(e.current, PipelineState::Paused),
            other => panic!("expected a transition mismatch, got {other:?}"),
        }
        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Paused);
    }

    #[tokio::test]
    async fn transition_succeeds_when_current_state_matches() {
        let store = InMemoryStore::new();
        store.put(pipeline("p1", PipelineState::Running));

        transition(&store, "p1", PipelineState::Running, PipelineState::Standby, "idle")
            .await
            .unwrap();

        assert_eq!(store.snapshot("p1").unwrap().state, PipelineState::Standby);
    }
}
