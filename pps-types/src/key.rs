use std::fmt;

/// Typed key for a pipeline, used wherever a pipeline name keys a map —
/// the Monitor Registry's two maps, and the Reconciler's per-pipeline
/// serialization lock — so those maps can't be accidentally keyed by some
/// other flavor of string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey(String);

impl PipelineKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A key namespaced under this pipeline, for sub-resources that need
    /// their own registry entry (one per cron-typed input, for example).
    pub fn namespaced(&self, suffix: &str) -> PipelineKey {
        PipelineKey(format!("{}/{suffix}", self.0))
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PipelineKey {
    fn from(s: &str) -> Self {
        PipelineKey(s.to_string())
    }
}

impl From<String> for PipelineKey {
    fn from(s: String) -> Self {
        PipelineKey(s)
    }
}

impl std::borrow::Borrow<str> for PipelineKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
