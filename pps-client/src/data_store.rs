use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::Error;

/// A commit reference: `{repo, id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitRef {
    pub repo: String,
    pub id: String,
}

/// The subset of commit metadata the master reasons about: whether it's
/// finished, and its repo/id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub commit: CommitRef,
    pub finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
}

/// Commit readiness filter for `subscribe_commits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Started,
    Ready,
    Finished,
}

pub type CommitStream = Pin<Box<dyn Stream<Item = Result<CommitInfo, Error>> + Send>>;

/// The object/content-addressed data store: repositories, commits, files
/// Out of scope to implement from scratch; the master core only ever
/// calls through this trait.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Subscribes to commits finished on `branch` of `repo`, scoped by
    /// `provenance` (a commit on the system spec repo at the pipeline's
    /// current spec-commit for standby, `None` for cron inputs), starting
    /// after `from_commit`.
    async fn subscribe_commits(
        &self,
        repo: &str,
        branch: &str,
        provenance: Option<&CommitRef>,
        from_commit: Option<&str>,
        state: CommitState,
    ) -> Result<CommitStream, Error>;

    /// Blocks until `commit` is finished, then returns its info.
    async fn block_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, Error>;

    /// Blocks (if `block`) until the job reading `commit` as output
    /// exists, then returns `Ok(())`.
    async fn inspect_job_output_commit(&self, repo: &str, id: &str, block: bool) -> Result<(), Error>;

    async fn list_file(&self, repo: &str, branch: &str, path: &str) -> Result<Vec<FileInfo>, Error>;
    async fn inspect_commit(&self, repo: &str, branch_or_id: &str) -> Result<Option<CommitInfo>, Error>;
    async fn delete_commit(&self, repo: &str, id: &str) -> Result<(), Error>;
    async fn start_commit(&self, repo: &str, branch: &str) -> Result<CommitInfo, Error>;
    async fn delete_file(&self, repo: &str, branch: &str, path: &str) -> Result<(), Error>;
    async fn put_file(&self, repo: &str, branch: &str, path: &str, contents: &[u8]) -> Result<(), Error>;
    async fn finish_commit(&self, repo: &str, branch: &str) -> Result<(), Error>;
}
