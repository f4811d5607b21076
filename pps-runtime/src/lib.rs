//! The pipeline master's control loop: leader election, the combined
//! spec/pod watch, the per-pipeline reconciler, the monitor registry and
//! its standby/crashing monitors, and the cron driver.

pub mod cron;
pub mod crashing;
pub mod election;
pub mod master;
pub mod monitors;
pub mod reconciler;
pub mod standby;
pub mod state;
pub mod watch_loop;

pub use election::run_with_leader_election;
pub use master::{run_master, MasterConfig};
pub use monitors::MonitorRegistry;
