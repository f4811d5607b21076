//! Trait boundaries for the pipeline master's external collaborators,
//! plus production adapters and in-memory test doubles.
//!
//! The master core (`pps-runtime`) is written entirely against the traits
//! in this crate — [`DesiredStateStore`], [`DistributedLock`],
//! [`ContainerOrchestrator`], [`DataStore`] — so that property tests can
//! swap in [`testing`]'s doubles without touching etcd or a real cluster.

mod data_store;
mod error;
mod lock;
mod orchestrator;
mod store;

pub mod testing;

pub use data_store::{CommitInfo, CommitRef, CommitState, CommitStream, DataStore, FileInfo};
pub use error::Error;
pub use lock::{DistributedLock, EtcdLock, LockSession};
pub use orchestrator::{
    ContainerOrchestrator, K8sOrchestrator, PodCondition, PodEvent, PodEventKind, PodStream, PodView, Workload,
};
pub use store::{CasError, DesiredStateStore, EtcdStore, WatchEvent, WatchStream};
