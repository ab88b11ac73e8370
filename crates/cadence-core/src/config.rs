use cadence_recurrence::RecurrenceRule;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_LOOKAHEAD_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 10 * 1024 * 1024; // 10 MiB per consumer
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 2_000;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub durability: DurabilityConfig,
    /// Jobs submitted by the daemon on start-up when not already known.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How far ahead of "now" the poll tick materialises occurrences.
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub default_max_consecutive_failures: u32,
    /// Base directory for relative script references.
    pub scripts_dir: Option<String>,
    /// Byte cap applied independently to every output consumer.
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,
    /// How long to keep draining output after a forced kill.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    /// Abort pending timers as soon as their job is disabled or removed.
    #[serde(default = "bool_true")]
    pub cancel_on_disable: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            lookahead_secs: DEFAULT_LOOKAHEAD_SECS,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            scripts_dir: None,
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            cancel_on_disable: true,
        }
    }
}

/// How scripts are launched by the process runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Program that receives the script path as its first argument (e.g. `sh`).
    /// When unset the script itself must be executable.
    pub interpreter: Option<String>,
    pub working_dir: Option<String>,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
        }
    }
}

/// A declarative job entry from `[[jobs]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: Option<String>,
    pub rule: RecurrenceRule,
    pub script: String,
    pub timeout_secs: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_lookahead_secs() -> u64 {
    DEFAULT_LOOKAHEAD_SECS
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_max_consecutive_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}
fn default_output_buffer_bytes() -> usize {
    DEFAULT_OUTPUT_BUFFER_BYTES
}
fn default_drain_grace_ms() -> u64 {
    DEFAULT_DRAIN_GRACE_MS
}
fn default_flush_interval_secs() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__LOOKAHEAD_SECS=30`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
