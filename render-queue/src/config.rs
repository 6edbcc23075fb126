//! Queue configuration.
//!
//! Every section deserializes with defaults, so a partial JSON document or
//! an empty environment yields a working queue. Environment variables
//! prefixed with `RENDER_QUEUE_` override individual fields.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Environment variable pointing at an optional JSON config file.
pub const CONFIG_FILE_ENV: &str = "RENDER_QUEUE_CONFIG_FILE";

/// Top-level configuration for the render queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderQueueConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

/// Dispatcher tick and per-job deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Polling interval in milliseconds. Submissions and completions also
    /// wake the dispatcher directly, so this only bounds retry latency.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-attempt processing deadline in seconds (0 = unlimited).
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_timeout_secs() -> u64 {
    3600
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-attempt deadline. Sub-second values round up to one
    /// second; `None` disables the deadline.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout_secs = timeout
            .map(|t| u64::try_from(t.as_millis().div_ceil(1000)).unwrap_or(u64::MAX).max(1))
            .unwrap_or(0);
        self
    }
}

/// Worker slot sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Slots created at startup; the pool never shrinks below this.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound on slots, including dynamically added ones.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Slots added per expansion.
    #[serde(default = "default_growth_step")]
    pub growth_step: usize,
    /// Idle time after which a dynamic slot is retired (0 = never).
    #[serde(default = "default_idle_shrink_secs")]
    pub idle_shrink_secs: u64,
}

fn default_min_workers() -> usize {
    3
}

fn default_max_workers() -> usize {
    8
}

fn default_growth_step() -> usize {
    2
}

fn default_idle_shrink_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            growth_step: default_growth_step(),
            idle_shrink_secs: default_idle_shrink_secs(),
        }
    }
}

impl PoolConfig {
    /// Fixed-size pool.
    pub fn fixed(workers: usize) -> Self {
        Self {
            min_workers: workers,
            max_workers: workers,
            ..Default::default()
        }
    }

    pub fn idle_shrink_after(&self) -> Option<Duration> {
        (self.idle_shrink_secs > 0).then(|| Duration::from_secs(self.idle_shrink_secs))
    }
}

/// Resource monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Total queued jobs above which the pool expands.
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
    /// Resident memory above which reclamation is requested.
    #[serde(default = "default_memory_threshold_bytes")]
    pub memory_threshold_bytes: u64,
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_queue_high_water() -> usize {
    10
}

fn default_memory_threshold_bytes() -> u64 {
    500 * 1024 * 1024
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            queue_high_water: default_queue_high_water(),
            memory_threshold_bytes: default_memory_threshold_bytes(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// Progress snapshot retention and event fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_snapshot_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ProgressConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }
}

/// Settings for the built-in simulated renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Base unit of simulated work per render stage.
    #[serde(default = "default_stage_delay_ms")]
    pub stage_delay_ms: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_stage_delay_ms() -> u64 {
    500
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            stage_delay_ms: default_stage_delay_ms(),
        }
    }
}

impl RenderConfig {
    pub fn stage_delay(&self) -> Duration {
        Duration::from_millis(self.stage_delay_ms)
    }
}

impl RenderQueueConfig {
    /// Parse a JSON document; missing sections fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, then an optional JSON file named by
    /// `RENDER_QUEUE_CONFIG_FILE`, then per-field overrides.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => {
                let contents = std::fs::read_to_string(&path)?;
                serde_json::from_str(&contents)?
            }
            _ => Self::default(),
        };

        override_from_env(&mut config.dispatcher.poll_interval_ms, "RENDER_QUEUE_POLL_INTERVAL_MS")?;
        override_from_env(&mut config.dispatcher.job_timeout_secs, "RENDER_QUEUE_JOB_TIMEOUT_SECS")?;
        override_from_env(&mut config.pool.min_workers, "RENDER_QUEUE_MIN_WORKERS")?;
        override_from_env(&mut config.pool.max_workers, "RENDER_QUEUE_MAX_WORKERS")?;
        override_from_env(&mut config.pool.growth_step, "RENDER_QUEUE_GROWTH_STEP")?;
        override_from_env(&mut config.pool.idle_shrink_secs, "RENDER_QUEUE_IDLE_SHRINK_SECS")?;
        override_from_env(&mut config.retry.max_retries, "RENDER_QUEUE_MAX_RETRIES")?;
        override_from_env(&mut config.retry.initial_delay_ms, "RENDER_QUEUE_RETRY_DELAY_MS")?;
        override_from_env(&mut config.monitor.check_interval_secs, "RENDER_QUEUE_MONITOR_INTERVAL_SECS")?;
        override_from_env(&mut config.monitor.queue_high_water, "RENDER_QUEUE_HIGH_WATER")?;
        override_from_env(&mut config.monitor.memory_threshold_bytes, "RENDER_QUEUE_MEMORY_THRESHOLD_BYTES")?;
        override_from_env(&mut config.progress.snapshot_ttl_secs, "RENDER_QUEUE_SNAPSHOT_TTL_SECS")?;
        override_from_env(&mut config.render.stage_delay_ms, "RENDER_QUEUE_STAGE_DELAY_MS")?;
        if let Ok(dir) = std::env::var("OUTPUT_DIR")
            && !dir.is_empty()
        {
            config.render.output_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.min_workers == 0 {
            return Err(Error::config("pool.min_workers must be at least 1"));
        }
        if self.pool.max_workers < self.pool.min_workers {
            return Err(Error::config(format!(
                "pool.max_workers ({}) must not be below pool.min_workers ({})",
                self.pool.max_workers, self.pool.min_workers
            )));
        }
        if self.retry.max_retries == 0 {
            return Err(Error::config("retry.max_retries must be at least 1"));
        }
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(Error::config("dispatcher.poll_interval_ms must be positive"));
        }
        if self.progress.event_capacity == 0 {
            return Err(Error::config("progress.event_capacity must be positive"));
        }
        Ok(())
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_render(mut self, render: RenderConfig) -> Self {
        self.render = render;
        self
    }
}

fn override_from_env<T: FromStr>(target: &mut T, key: &str) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            *target = raw
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e)))?;
            Ok(())
        }
        _ => Ok(()),
    }
}
