//! Runtime tunables for every component. Immutable after construction
//! (§5: "Configuration is immutable after construction").

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Output Buffer: max retained lines per job.
    pub max_output_lines_per_job: usize,
    /// Event Broadcaster: bounded per-subscriber queue capacity.
    pub subscriber_queue_capacity: usize,
    /// Event Broadcaster: keepalive interval when no real event arrives.
    pub keepalive_interval: Duration,
    /// Queue & Admission: poll loop interval.
    pub queue_poll_interval: Duration,
    /// Queue & Admission: concurrency cap for the `backup` class.
    pub max_concurrent_backups: usize,
    /// Queue & Admission: concurrency cap for the `operation` class.
    pub max_concurrent_operations: usize,
    /// Job Manager: delay before evicting a terminal job from memory.
    pub auto_cleanup_delay: Duration,
    /// Process Executor: grace period between polite terminate and force-kill.
    pub process_terminate_grace: Duration,
    /// Archive Tree: overall timeout for a listing helper invocation.
    pub archive_listing_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_output_lines_per_job: 1000,
            subscriber_queue_capacity: 100,
            keepalive_interval: Duration::from_secs(30),
            queue_poll_interval: Duration::from_millis(100),
            max_concurrent_backups: 2,
            max_concurrent_operations: 4,
            auto_cleanup_delay: Duration::from_secs(30),
            process_terminate_grace: Duration::from_secs(10),
            archive_listing_timeout: Duration::from_secs(120),
        }
    }
}

/// On-disk shape of [`RuntimeConfig`]: durations stored as milliseconds
/// since `serde` has no native `Duration` support.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRuntimeConfig {
    max_output_lines_per_job: usize,
    subscriber_queue_capacity: usize,
    keepalive_interval_ms: u64,
    queue_poll_interval_ms: u64,
    max_concurrent_backups: usize,
    max_concurrent_operations: usize,
    auto_cleanup_delay_ms: u64,
    process_terminate_grace_ms: u64,
    archive_listing_timeout_ms: u64,
}

impl From<&RuntimeConfig> for PersistedRuntimeConfig {
    fn from(c: &RuntimeConfig) -> Self {
        Self {
            max_output_lines_per_job: c.max_output_lines_per_job,
            subscriber_queue_capacity: c.subscriber_queue_capacity,
            keepalive_interval_ms: c.keepalive_interval.as_millis() as u64,
            queue_poll_interval_ms: c.queue_poll_interval.as_millis() as u64,
            max_concurrent_backups: c.max_concurrent_backups,
            max_concurrent_operations: c.max_concurrent_operations,
            auto_cleanup_delay_ms: c.auto_cleanup_delay.as_millis() as u64,
            process_terminate_grace_ms: c.process_terminate_grace.as_millis() as u64,
            archive_listing_timeout_ms: c.archive_listing_timeout.as_millis() as u64,
        }
    }
}

impl From<PersistedRuntimeConfig> for RuntimeConfig {
    fn from(p: PersistedRuntimeConfig) -> Self {
        Self {
            max_output_lines_per_job: p.max_output_lines_per_job,
            subscriber_queue_capacity: p.subscriber_queue_capacity,
            keepalive_interval: Duration::from_millis(p.keepalive_interval_ms),
            queue_poll_interval: Duration::from_millis(p.queue_poll_interval_ms),
            max_concurrent_backups: p.max_concurrent_backups,
            max_concurrent_operations: p.max_concurrent_operations,
            auto_cleanup_delay: Duration::from_millis(p.auto_cleanup_delay_ms),
            process_terminate_grace: Duration::from_millis(p.process_terminate_grace_ms),
            archive_listing_timeout: Duration::from_millis(p.archive_listing_timeout_ms),
        }
    }
}

impl RuntimeConfig {
    /// Loads `config.json` from the app's XDG config directory, falling
    /// back to [`Default`] if it does not exist.
    pub fn load_or_default(app: &str) -> anyhow::Result<Self> {
        let path = borgitory_util::config::config_path(app, "config.json")?;
        Ok(Self::load_from_or_default(&path)?)
    }

    fn load_from_or_default(path: &Path) -> anyhow::Result<Self> {
        match borgitory_util::config::load_json::<PersistedRuntimeConfig>(path)? {
            Some(persisted) => Ok(persisted.into()),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, app: &str) -> anyhow::Result<()> {
        let path = borgitory_util::config::config_path(app, "config.json")?;
        borgitory_util::config::save_json_atomic(&path, &PersistedRuntimeConfig::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RuntimeConfig::load_from_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.max_concurrent_backups, RuntimeConfig::default().max_concurrent_backups);
    }

    #[test]
    fn saved_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.max_concurrent_backups = 9;

        borgitory_util::config::save_json_atomic(&path, &PersistedRuntimeConfig::from(&cfg)).unwrap();
        let loaded = RuntimeConfig::load_from_or_default(&path).unwrap();
        assert_eq!(loaded.max_concurrent_backups, 9);
    }
}
