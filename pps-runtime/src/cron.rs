//! Drives a pipeline's cron-typed input on its own clock: on each tick it
//! starts a commit, writes a single empty file named for the tick's RFC
//! 3339 timestamp, and finishes the commit, independent of anything the
//! spec watcher or reconciler does.

use std::str::FromStr;
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use cron::Schedule;
use pps_client::DataStore;
use pps_types::CronInput;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error(transparent)]
    Client(#[from] pps_client::Error),
    #[error("cron schedule {0:?} has no further occurrences after the given time")]
    ScheduleExhausted(String),
}

/// Runs until `cancellation` fires. Persistent-store errors restart the
/// tick loop under exponential backoff rather than propagating.
pub async fn run_cron_driver(data_store: Arc<dyn DataStore>, input: CronInput, cancellation: CancellationToken) {
    let schedule = match Schedule::from_str(&with_seconds(&input.spec)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(cron = %input.name, spec = %input.spec, error = %e, "invalid cron schedule, driver exiting");
            return;
        }
    };

    let mut latest = latest_commit_time(&*data_store, &input)
        .await
        .unwrap_or(input.start);
    let mut backoff_policy = ExponentialBackoff::default();

    loop {
        if cancellation.is_cancelled() {
            info!(cron = %input.name, "cron driver cancelled");
            return;
        }
        match tick(&*data_store, &input, &schedule, latest, &cancellation).await {
            Ok(Some(next)) => {
                latest = next;
                backoff_policy.reset();
            }
            Ok(None) => {
                info!(cron = %input.name, "cron driver cancelled mid-wait");
                return;
            }
            Err(e) => {
                warn!(cron = %input.name, error = %e, "cron tick failed, retrying after backoff");
                let delay = backoff_policy
                    .next_backoff()
                    .unwrap_or(std::time::Duration::from_secs(60));
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Runs one cleanup-wait-commit cycle. `Ok(None)` means cancellation fired
/// while waiting for the next occurrence.
async fn tick(
    data_store: &dyn DataStore,
    input: &CronInput,
    schedule: &Schedule,
    latest: DateTime<Utc>,
    cancellation: &CancellationToken,
) -> Result<Option<DateTime<Utc>>, TickError> {
    cleanup_open_commit(data_store, &input.repo).await?;

    let next = schedule
        .after(&latest)
        .next()
        .ok_or_else(|| TickError::ScheduleExhausted(input.name.clone()))?;

    let now = Utc::now();
    if next > now {
        let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = cancellation.cancelled() => return Ok(None),
            _ = tokio::time::sleep(wait) => {}
        }
    }

    data_store.start_commit(&input.repo, "master").await?;
    if input.overwrite {
        match data_store.delete_file(&input.repo, "master", "").await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    data_store
        .put_file(&input.repo, "master", &next.to_rfc3339(), &[])
        .await?;
    data_store.finish_commit(&input.repo, "master").await?;

    Ok(Some(next))
}

async fn cleanup_open_commit(data_store: &dyn DataStore, repo: &str) -> Result<(), TickError> {
    if let Some(info) = data_store.inspect_commit(repo, "master").await? {
        if info.finished.is_none() {
            data_store.delete_commit(repo, &info.commit.id).await?;
        }
    }
    Ok(())
}

async fn latest_commit_time(data_store: &dyn DataStore, input: &CronInput) -> Option<DateTime<Utc>> {
    let files = data_store.list_file(&input.repo, "master", "/").await.ok()?;
    files
        .into_iter()
        .filter_map(|f| {
            DateTime::parse_from_rfc3339(&f.path)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
        .max()
}

/// The cron crate's grammar carries a leading seconds field; pipeline
/// inputs use the standard five-field form, so pin seconds to zero.
fn with_seconds(spec: &str) -> String {
    format!("0 {spec}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pps_client::testing::InMemoryDataStore;

    fn input(name: &str, spec: &str, start: DateTime<Utc>, overwrite: bool) -> CronInput {
        CronInput {
            name: name.into(),
            repo: format!("{name}-repo"),
            spec: spec.into(),
            start,
            overwrite,
        }
    }

    #[tokio::test]
    async fn produces_one_finished_commit_per_tick_then_stops_on_cancel() {
        let data_store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let start = Utc::now() - chrono::Duration::seconds(2);
        let cron_input = input("hourly", "* * * * *", start, false);
        let cancellation = CancellationToken::new();

        let token = cancellation.clone();
        let handle = tokio::spawn(run_cron_driver(data_store.clone(), cron_input.clone(), token));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancellation.cancel();
        handle.await.unwrap();

        let files = data_store
            .list_file(&cron_input.repo, "master", "/")
            .await
            .unwrap();
        assert!(!files.is_empty());
    }

    #[tokio::test]
    async fn invalid_schedule_exits_immediately() {
        let data_store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let cron_input = input("bad", "not a schedule", Utc::now(), false);
        let cancellation = CancellationToken::new();

        tokio::time::timeout(
            std::time::Duration::from_millis(200),
            run_cron_driver(data_store, cron_input, cancellation),
        )
        .await
        .expect("driver should exit immediately rather than hang");
    }
}
