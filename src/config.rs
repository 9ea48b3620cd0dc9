//! Configuration management for the analytics core
//!
//! TOML configuration with `AWARDLENS_*` environment variable overrides and
//! defaults for every field, so an empty file is a valid configuration.

use crate::query::rounding::RoundingPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Dataset location and caching
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Synchronous query limits
    #[serde(default)]
    pub query: QueryConfig,

    /// Export pipeline
    #[serde(default)]
    pub export: ExportConfig,

    /// Background jobs
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Rounding heuristic policy table
    #[serde(default)]
    pub rounding: RoundingPolicy,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of runtime worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Dataset configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    /// Directory holding the precomputed segments
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Decoded segments kept in memory
    #[serde(default = "default_segment_cache_capacity")]
    pub segment_cache_capacity: usize,

    /// First year accepted by time filters when the catalog has no dates
    #[serde(default = "default_first_year")]
    pub first_year: i32,

    /// Last year accepted by time filters when the catalog has no dates
    #[serde(default = "default_last_year")]
    pub last_year: i32,
}

/// Query configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Wall-clock budget of synchronous aggregate/histogram/search calls
    #[serde(default = "default_sync_budget_ms")]
    pub sync_budget_ms: u64,

    /// Rows a synchronous call may scan (0 = unlimited)
    #[serde(default)]
    pub max_sync_scan_rows: u64,

    /// Rows per parallel scan morsel
    #[serde(default = "default_morsel_rows")]
    pub morsel_rows: usize,

    /// Default group count for aggregate calls
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,

    /// Largest accepted topN
    #[serde(default = "default_max_top_n")]
    pub max_top_n: usize,

    /// Default histogram resolution
    #[serde(default = "default_num_bins")]
    pub default_num_bins: usize,

    /// Largest accepted histogram resolution
    #[serde(default = "default_max_num_bins")]
    pub max_num_bins: usize,

    /// Largest accepted page size
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

/// Export configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    /// Rows written between flush/progress/cancel checkpoints
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,

    /// Largest row count served inline
    #[serde(default = "default_sync_row_threshold")]
    pub sync_row_threshold: u64,

    /// Estimated CSV bytes per contract row
    #[serde(default = "default_row_bytes_estimate")]
    pub row_bytes_estimate: u64,

    /// Estimated CSV bytes per aggregated row
    #[serde(default = "default_aggregated_row_bytes_estimate")]
    pub aggregated_row_bytes_estimate: u64,
}

/// Background task configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TasksConfig {
    /// Directory for job artifacts and manifests
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Concurrent job workers
    #[serde(default = "default_task_workers")]
    pub workers: usize,

    /// Pending jobs the queue accepts
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long finished jobs and artifacts are kept
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Reaper sweep interval
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Base delay between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Per-job progress events buffered for slow subscribers
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace) or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_workers() -> usize { num_cpus::get() }
fn default_data_dir() -> PathBuf { PathBuf::from("/data/awardlens") }
fn default_segment_cache_capacity() -> usize { 64 }
fn default_first_year() -> i32 { 2013 }
fn default_last_year() -> i32 { 2025 }
fn default_sync_budget_ms() -> u64 { 5_000 }
fn default_morsel_rows() -> usize { 65_536 }
fn default_top_n() -> usize { 20 }
fn default_max_top_n() -> usize { 1_000 }
fn default_num_bins() -> usize { 1_000 }
fn default_max_num_bins() -> usize { 10_000 }
fn default_max_page_size() -> u32 { 100 }
fn default_chunk_rows() -> usize { 25_000 }
fn default_sync_row_threshold() -> u64 { 100_000 }
fn default_row_bytes_estimate() -> u64 { 250 }
fn default_aggregated_row_bytes_estimate() -> u64 { 120 }
fn default_artifact_dir() -> PathBuf { PathBuf::from("/data/awardlens/exports") }
fn default_task_workers() -> usize { 2 }
fn default_queue_capacity() -> usize { 256 }
fn default_retention_secs() -> u64 { 24 * 3600 }
fn default_reaper_interval_secs() -> u64 { 600 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_progress_buffer() -> usize { 64 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            segment_cache_capacity: default_segment_cache_capacity(),
            first_year: default_first_year(),
            last_year: default_last_year(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            sync_budget_ms: default_sync_budget_ms(),
            max_sync_scan_rows: 0,
            morsel_rows: default_morsel_rows(),
            default_top_n: default_top_n(),
            max_top_n: default_max_top_n(),
            default_num_bins: default_num_bins(),
            max_num_bins: default_max_num_bins(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_rows: default_chunk_rows(),
            sync_row_threshold: default_sync_row_threshold(),
            row_bytes_estimate: default_row_bytes_estimate(),
            aggregated_row_bytes_estimate: default_aggregated_row_bytes_estimate(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            workers: default_task_workers(),
            queue_capacity: default_queue_capacity(),
            retention_secs: default_retention_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            progress_buffer: default_progress_buffer(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(host) = std::env::var("AWARDLENS_HOST") {
            self.server.host = host;
        }
        override_parsed("AWARDLENS_PORT", &mut self.server.port);

        // Dataset
        if let Ok(data_dir) = std::env::var("AWARDLENS_DATA_DIR") {
            self.dataset.data_dir = PathBuf::from(data_dir);
        }
        override_parsed(
            "AWARDLENS_SEGMENT_CACHE_CAPACITY",
            &mut self.dataset.segment_cache_capacity,
        );

        // Query / export
        override_parsed("AWARDLENS_SYNC_BUDGET_MS", &mut self.query.sync_budget_ms);
        override_parsed(
            "AWARDLENS_SYNC_ROW_THRESHOLD",
            &mut self.export.sync_row_threshold,
        );

        // Tasks
        if let Ok(dir) = std::env::var("AWARDLENS_ARTIFACT_DIR") {
            self.tasks.artifact_dir = PathBuf::from(dir);
        }
        override_parsed("AWARDLENS_TASK_WORKERS", &mut self.tasks.workers);
        override_parsed("AWARDLENS_RETENTION_SECS", &mut self.tasks.retention_secs);

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.dataset.data_dir.as_os_str().is_empty() {
            return Err("Data directory cannot be empty".to_string());
        }
        if self.dataset.first_year > self.dataset.last_year {
            return Err(format!(
                "dataset.first_year ({}) is after dataset.last_year ({})",
                self.dataset.first_year, self.dataset.last_year
            ));
        }

        if self.query.morsel_rows == 0 {
            return Err("query.morsel_rows must be > 0".to_string());
        }
        if self.query.default_top_n == 0 || self.query.default_top_n > self.query.max_top_n {
            return Err("query.default_top_n must be in 1..=max_top_n".to_string());
        }
        if self.query.default_num_bins == 0
            || self.query.default_num_bins > self.query.max_num_bins
        {
            return Err("query.default_num_bins must be in 1..=max_num_bins".to_string());
        }
        if self.query.max_page_size == 0 {
            return Err("query.max_page_size must be > 0".to_string());
        }

        if self.export.chunk_rows == 0 {
            return Err("export.chunk_rows must be > 0".to_string());
        }

        if self.tasks.artifact_dir.as_os_str().is_empty() {
            return Err("Artifact directory cannot be empty".to_string());
        }
        if self.tasks.workers == 0 {
            return Err("tasks.workers must be > 0".to_string());
        }
        if self.tasks.queue_capacity == 0 {
            return Err("tasks.queue_capacity must be > 0".to_string());
        }
        if self.tasks.reaper_interval_secs == 0 {
            return Err("tasks.reaper_interval_secs must be > 0".to_string());
        }

        self.rounding.validate()
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(var, value = %value, "Ignoring unparseable override"),
        }
    }
}

mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
