//! Environment-variable configuration, read once at startup.

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub etcd_endpoints: Vec<String>,
    pub etcd_prefix: String,
    pub lock_ttl_secs: i64,
    pub crashing_poll_interval_secs: u64,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let etcd_endpoints = env_var("PPS_ETCD_ENDPOINTS", "http://localhost:2379")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        let lock_ttl_secs = env_var("PPS_ETCD_LOCK_TTL_SECS", "30")
            .parse()
            .context("PPS_ETCD_LOCK_TTL_SECS must be an integer")?;
        let crashing_poll_interval_secs = env_var("PPS_CRASHING_POLL_INTERVAL_SECS", "10")
            .parse()
            .context("PPS_CRASHING_POLL_INTERVAL_SECS must be an integer")?;

        let log_format = match env_var("PPS_LOG_FORMAT", "text").as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            namespace: env_var("PPS_NAMESPACE", "default"),
            etcd_endpoints,
            etcd_prefix: env_var("PPS_ETCD_PREFIX", "/pachyderm/pps"),
            lock_ttl_secs,
            crashing_poll_interval_secs,
            log_format,
        })
    }
}

fn env_var(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
