use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::HourWindow;

// Unique work names. Two fixed slot names so the pair never collides, plus
// one for ad-hoc diagnostic runs.
pub const WORK_NAME_PREFIX: &str = "memwake/MemoryNotificationV1";
pub const WORK_NAME_SLOT_1: &str = "memwake/MemoryNotificationV1-1";
pub const WORK_NAME_SLOT_2: &str = "memwake/MemoryNotificationV1-2";
pub const WORK_NAME_DEBUG: &str = "memwake/MemoryNotificationV1-debug";

pub const ENGINE_CACHE_KEY: &str = "memwake::memory_notification::engine";
pub const DEFAULT_ENTRYPOINT_LIBRARY: &str = "memwake::memory_notification";
pub const DEFAULT_ENTRYPOINT_NAME: &str = "memory_notification_worker_entrypoint";

pub const DEFAULT_START_HOUR: u32 = 9;
pub const DEFAULT_END_HOUR: u32 = 21;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 15 * 60;
pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 10 * 60;

/// Top-level config (memwake.toml + MEMWAKE_* env overrides).
///
/// Nested keys use a double underscore: `MEMWAKE_SCHEDULE__START_HOUR=8`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemwakeConfig {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
}

/// Wake window and retry policy for scheduled runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    /// Base of the exponential backoff the queue applies on retry.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

impl ScheduleConfig {
    pub fn window(&self) -> HourWindow {
        HourWindow::new(self.start_hour, self.end_hour)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: DEFAULT_START_HOUR,
            end_hour: DEFAULT_END_HOUR,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound on waiting for the engine loader. Past this the run is
    /// handed back to the queue for retry.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_entrypoint_library")]
    pub entrypoint_library: String,
    #[serde(default = "default_entrypoint_name")]
    pub entrypoint_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
            entrypoint_library: default_entrypoint_library(),
            entrypoint_name: default_entrypoint_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A running job older than this is stopped and its worker re-armed.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Target used by the daemon's connectivity bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_addr: default_probe_addr(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_start_hour() -> u32 {
    DEFAULT_START_HOUR
}
fn default_end_hour() -> u32 {
    DEFAULT_END_HOUR
}
fn default_backoff_base_secs() -> u64 {
    DEFAULT_BACKOFF_BASE_SECS
}
fn default_init_timeout_secs() -> u64 {
    DEFAULT_INIT_TIMEOUT_SECS
}
fn default_entrypoint_library() -> String {
    DEFAULT_ENTRYPOINT_LIBRARY.to_string()
}
fn default_entrypoint_name() -> String {
    DEFAULT_ENTRYPOINT_NAME.to_string()
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn default_probe_addr() -> String {
    "1.1.1.1:443".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    1_500
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.memwake/memwake.db", home)
}

impl MemwakeConfig {
    /// Load config from a TOML file with MEMWAKE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.memwake/memwake.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("MEMWAKE_").split("__")),
        )
    }

    /// Extract and validate a config from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: MemwakeConfig = figment
            .extract()
            .map_err(|e| crate::error::MemwakeError::Config(e.to_string()))?;

        config.schedule.window().validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.memwake/memwake.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_yields_defaults() {
        let config = MemwakeConfig::from_figment(Figment::from(Toml::string(""))).unwrap();
        assert_eq!(config.schedule.start_hour, 9);
        assert_eq!(config.schedule.end_hour, 21);
        assert_eq!(config.schedule.backoff_base_secs, 900);
        assert_eq!(config.worker.entrypoint_name, DEFAULT_ENTRYPOINT_NAME);
        assert_eq!(config.queue.poll_interval_ms, 1_000);
    }

    #[test]
    fn toml_overrides_window() {
        let toml = r#"
            [schedule]
            start_hour = 7
            end_hour = 10

            [queue]
            job_timeout_secs = 60
        "#;
        let config = MemwakeConfig::from_figment(Figment::from(Toml::string(toml))).unwrap();
        assert_eq!(config.schedule.window(), HourWindow::new(7, 10));
        assert_eq!(config.queue.job_timeout_secs, 60);
    }

    #[test]
    fn inverted_window_fails_to_load() {
        let toml = r#"
            [schedule]
            start_hour = 22
            end_hour = 6
        "#;
        let err = MemwakeConfig::from_figment(Figment::from(Toml::string(toml))).unwrap_err();
        assert_eq!(err.code(), "INVALID_WINDOW");
    }

    #[test]
    fn slot_names_are_distinct() {
        assert_ne!(WORK_NAME_SLOT_1, WORK_NAME_SLOT_2);
        assert_ne!(WORK_NAME_SLOT_1, WORK_NAME_DEBUG);
        assert!(WORK_NAME_SLOT_1.starts_with(WORK_NAME_PREFIX));
        assert!(WORK_NAME_DEBUG.starts_with(WORK_NAME_PREFIX));
    }
}
