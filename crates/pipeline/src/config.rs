//! Engine configuration.
//!
//! Everything has a default; `EngineConfig::from_env` overrides from
//! `JOBFLOW_*` variables. A value that fails to parse is logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use jobflow_cache::{CacheConfig, EvictionStrategy};
use jobflow_jobs::JobManagerConfig;
use jobflow_observability::{LogConfig, LogFormat};

pub const ENV_MAX_CONCURRENT: &str = "JOBFLOW_MAX_CONCURRENT";
pub const ENV_JOB_RETENTION_SECS: &str = "JOBFLOW_JOB_RETENTION_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "JOBFLOW_POLL_INTERVAL_MS";
pub const ENV_CACHE_MAX_SIZE: &str = "JOBFLOW_CACHE_MAX_SIZE";
pub const ENV_CACHE_TTL_SECS: &str = "JOBFLOW_CACHE_TTL_SECS";
pub const ENV_CACHE_STRATEGY: &str = "JOBFLOW_CACHE_STRATEGY";
pub const ENV_CACHE_SWEEP_SECS: &str = "JOBFLOW_CACHE_SWEEP_SECS";
pub const ENV_LOG_FORMAT: &str = "JOBFLOW_LOG_FORMAT";
pub const ENV_LOG_FILTER: &str = "JOBFLOW_LOG_FILTER";

/// Settings for one `PipelineManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub jobs: JobManagerConfig,
    pub cache: CacheConfig,
    /// Poll interval used by awaited `process` calls unless overridden.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            jobs: JobManagerConfig::default().with_name("pipeline"),
            cache: CacheConfig::default(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl PipelineConfig {
    pub fn with_jobs(mut self, jobs: JobManagerConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Process-level configuration: pipeline plus logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub log: LogConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let pipeline = &mut config.pipeline;

        if let Some(max) = parse::<usize>(&lookup, ENV_MAX_CONCURRENT) {
            pipeline.jobs = pipeline.jobs.clone().with_max_concurrent(max);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_JOB_RETENTION_SECS) {
            pipeline.jobs.retention = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = parse::<u64>(&lookup, ENV_POLL_INTERVAL_MS) {
            pipeline.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse::<usize>(&lookup, ENV_CACHE_MAX_SIZE) {
            pipeline.cache = pipeline.cache.clone().with_max_size(size);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_CACHE_TTL_SECS) {
            pipeline.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_CACHE_SWEEP_SECS) {
            pipeline.cache.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(raw) = lookup(ENV_CACHE_STRATEGY) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "lru" => pipeline.cache.strategy = EvictionStrategy::Lru,
                "ttl" => pipeline.cache.strategy = EvictionStrategy::Ttl,
                "lfu" => pipeline.cache.strategy = EvictionStrategy::Lfu,
                _ => warn!(key = ENV_CACHE_STRATEGY, value = %raw, "ignoring invalid setting"),
            }
        }

        if let Some(format) = parse::<LogFormat>(&lookup, ENV_LOG_FORMAT) {
            config.log.format = format;
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER).filter(|f| !f.trim().is_empty()) {
            config.log.default_filter = filter;
        }

        config
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring invalid setting");
            None
        }
    }
}
