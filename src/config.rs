//! Service configuration from environment variables

use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::queue::QueueDefaults;
use crate::services::worker::WorkerOptions;
use crate::tasks::scheduler::{Schedule, SchedulerOptions};

/// How scheduled sweeps retrain stale connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// Enqueue schema rebuild jobs for the worker
    Enqueue,
    /// Train inside the sweep
    Inline,
}

impl FromStr for SchedulerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enqueue" => Ok(SchedulerMode::Enqueue),
            "inline" => Ok(SchedulerMode::Inline),
            other => bail!("expected `enqueue` or `inline`, got `{}`", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Postgres store URL; `None` selects the in-process store
    pub database_url: Option<String>,
    pub worker: WorkerOptions,
    pub queue: QueueDefaults,
    pub scheduler_enabled: bool,
    pub scheduler_mode: SchedulerMode,
    pub scheduler: SchedulerOptions,
    pub heartbeat_interval: Duration,
    pub event_bus_capacity: usize,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").filter(|url| !url.eq_ignore_ascii_case("memory"));

        let worker = WorkerOptions {
            team_size: parse_or(&get, "WORKER_TEAM_SIZE", 3usize)?,
            team_concurrency: 1,
            poll_interval: Duration::from_secs(parse_or(&get, "WORKER_POLL_INTERVAL_SECS", 2u64)?),
        };
        if worker.team_size == 0 {
            bail!("WORKER_TEAM_SIZE must be at least 1");
        }
        if worker.poll_interval.is_zero() {
            bail!("WORKER_POLL_INTERVAL_SECS must be at least 1");
        }

        let queue = QueueDefaults {
            retry_limit: parse_or(&get, "JOB_RETRY_LIMIT", 3u32)?,
            retry_delay_secs: parse_or(&get, "JOB_RETRY_DELAY_SECS", 30u64)?,
            retry_backoff: parse_or(&get, "JOB_RETRY_BACKOFF", true)?,
            expire_in_secs: parse_or(&get, "JOB_EXPIRE_SECS", 900u64)?,
        };

        let schedule: Schedule = match get("SCHEDULER_CRON") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid SCHEDULER_CRON `{}`: {}", raw, e))?,
            None => Schedule::default(),
        };
        let scheduler = SchedulerOptions {
            schedule,
            batch_size: parse_or(&get, "SCHEDULER_BATCH_SIZE", 5usize)?,
            batch_delay: Duration::from_secs(parse_or(&get, "SCHEDULER_BATCH_DELAY_SECS", 5u64)?),
            ..Default::default()
        };
        if scheduler.batch_size == 0 {
            bail!("SCHEDULER_BATCH_SIZE must be at least 1");
        }

        let heartbeat_interval = Duration::from_secs(parse_or(&get, "HEARTBEAT_INTERVAL_SECS", 30u64)?);
        if heartbeat_interval.is_zero() {
            bail!("HEARTBEAT_INTERVAL_SECS must be at least 1");
        }

        Ok(Self {
            listen_addr: parse_or(&get, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            database_url,
            worker,
            queue,
            scheduler_enabled: parse_or(&get, "SCHEDULER_ENABLED", true)?,
            scheduler_mode: parse_or(&get, "SCHEDULER_MODE", SchedulerMode::Enqueue)?,
            scheduler,
            heartbeat_interval,
            event_bus_capacity: parse_or(&get, "EVENT_BUS_CAPACITY", 1024usize)?.max(1),
            json_logs: get("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    /// Store URL with credentials masked, for logging
    pub fn redacted_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, host)) => format!("***@{}", host),
                None => url.clone(),
            },
            None => "memory".to_string(),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}: `{}`", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.worker.team_size, 3);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(2));
        assert_eq!(config.queue, QueueDefaults::default());
        assert!(config.scheduler_enabled);
        assert_eq!(config.scheduler_mode, SchedulerMode::Enqueue);
        assert_eq!(config.scheduler.schedule, Schedule::default());
        assert_eq!(config.scheduler.batch_size, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.event_bus_capacity, 1024);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("DATABASE_URL", "postgres://app:secret@db:5432/keeper"),
            ("SCHEDULER_CRON", "every:600"),
            ("SCHEDULER_MODE", "inline"),
            ("JOB_RETRY_BACKOFF", "false"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.scheduler.schedule, Schedule::Every(Duration::from_secs(600)));
        assert_eq!(config.scheduler_mode, SchedulerMode::Inline);
        assert!(!config.queue.retry_backoff);
        assert!(config.json_logs);
        assert_eq!(config.redacted_database_url(), "***@db:5432/keeper");
    }

    #[test]
    fn test_memory_store_keyword() {
        assert!(config(&[("DATABASE_URL", "memory")]).unwrap().database_url.is_none());
    }

    #[test]
    fn test_invalid_values_fail() {
        let err = config(&[("WORKER_TEAM_SIZE", "many")]).unwrap_err();
        assert!(err.to_string().contains("WORKER_TEAM_SIZE"));
        assert!(config(&[("WORKER_TEAM_SIZE", "0")]).is_err());
        assert!(config(&[("SCHEDULER_CRON", "hourly")]).is_err());
        assert!(config(&[("SCHEDULER_MODE", "later")]).is_err());
        assert!(config(&[("LISTEN_ADDR", "nowhere")]).is_err());
    }
}
