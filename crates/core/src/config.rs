//! Loader configuration
//!
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically. Every field has a default, so partial files and
//! partial environments are fine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a [`ThumbnailManager`](crate::ThumbnailManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Entry cap of the thumbnail cache
    pub max_cache_size: usize,

    /// Idle time after which an undisplayed entry may be dropped
    pub cache_timeout_ms: u64,

    /// Concurrent fetch cap (K)
    pub max_concurrent_loads: usize,

    /// Extra slots usable only by urgent keys
    pub urgent_cap_boost: usize,

    /// Prefetch margin around the viewport
    pub viewport_lookahead_px: f32,

    /// Cells admitted per background tick
    pub background_batch_size: usize,

    /// Delay before the single retry of a transient failure
    pub retry_delay_ms: u64,

    /// Background filler tick interval
    pub frame_interval_ms: u64,

    /// Minimum time between two time-triggered cleanups
    pub cleanup_interval_ms: u64,

    /// How long an idle worker sleeps before re-checking for shutdown
    pub poll_interval_ms: u64,

    /// Requested thumbnail edge length in pixels
    pub thumbnail_size: u32,

    /// Base URL of the thumbnail endpoint
    pub server_url: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1000,
            cache_timeout_ms: 15 * 60 * 1000,
            max_concurrent_loads: 24,
            urgent_cap_boost: 4,
            viewport_lookahead_px: 200.0,
            background_batch_size: 3,
            retry_delay_ms: 300,
            frame_interval_ms: 16,
            cleanup_interval_ms: 60 * 1000,
            poll_interval_ms: 100,
            thumbnail_size: 512,
            server_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl LoaderConfig {
    pub fn with_max_cache_size(mut self, entries: usize) -> Self {
        self.max_cache_size = entries;
        self
    }

    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_loads(mut self, loads: usize) -> Self {
        self.max_concurrent_loads = loads;
        self
    }

    pub fn with_urgent_cap_boost(mut self, boost: usize) -> Self {
        self.urgent_cap_boost = boost;
        self
    }

    pub fn with_viewport_lookahead(mut self, px: f32) -> Self {
        self.viewport_lookahead_px = px;
        self
    }

    pub fn with_background_batch_size(mut self, batch: usize) -> Self {
        self.background_batch_size = batch;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_thumbnail_size(mut self, px: u32) -> Self {
        self.thumbnail_size = px;
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Number of fetch workers: the base cap plus the urgent boost
    pub fn worker_count(&self) -> usize {
        self.max_concurrent_loads + self.urgent_cap_boost
    }

    /// Check that the configuration can drive a loader.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str| Err(ConfigError::InvalidValue(key.to_string()));

        if self.max_concurrent_loads == 0 {
            return invalid("max_concurrent_loads");
        }
        if self.max_cache_size == 0 {
            return invalid("max_cache_size");
        }
        if self.background_batch_size == 0 {
            return invalid("background_batch_size");
        }
        if self.viewport_lookahead_px.is_nan() || self.viewport_lookahead_px < 0.0 {
            return invalid("viewport_lookahead_px");
        }
        if self.thumbnail_size == 0 {
            return invalid("thumbnail_size");
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `THUMBGRID_MAX_CACHE_SIZE`
    /// - `THUMBGRID_CACHE_TIMEOUT_MS`
    /// - `THUMBGRID_MAX_CONCURRENT_LOADS`
    /// - `THUMBGRID_URGENT_CAP_BOOST`
    /// - `THUMBGRID_VIEWPORT_LOOKAHEAD_PX`
    /// - `THUMBGRID_BACKGROUND_BATCH_SIZE`
    /// - `THUMBGRID_RETRY_DELAY_MS`
    /// - `THUMBGRID_FRAME_INTERVAL_MS`
    /// - `THUMBGRID_CLEANUP_INTERVAL_MS`
    /// - `THUMBGRID_POLL_INTERVAL_MS`
    /// - `THUMBGRID_THUMBNAIL_SIZE`
    /// - `THUMBGRID_SERVER_URL`
    ///
    /// # Errors
    /// Returns an error if any variable holds an unparsable or invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_env("THUMBGRID_MAX_CACHE_SIZE")? {
            config.max_cache_size = v;
        }
        if let Some(v) = parse_env("THUMBGRID_CACHE_TIMEOUT_MS")? {
            config.cache_timeout_ms = v;
        }
        if let Some(v) = parse_env("THUMBGRID_MAX_CONCURRENT_LOADS")? {
            config.max_concurrent_loads = v;
        }
        if let Some(v) = parse_env("THUMBGRID_URGENT_CAP_BOOST")? {
            config.urgent_cap_boost = v;
        }
        if let Some(v) = parse_env("THUMBGRID_VIEWPORT_LOOKAHEAD_PX")? {
            config.viewport_lookahead_px = v;
        }
        if let Some(v) = parse_env("THUMBGRID_BACKGROUND_BATCH_SIZE")? {
            config.background_batch_size = v;
        }
        if let Some(v) = parse_env("THUMBGRID_RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Some(v) = parse_env("THUMBGRID_FRAME_INTERVAL_MS")? {
            config.frame_interval_ms = v;
        }
        if let Some(v) = parse_env("THUMBGRID_CLEANUP_INTERVAL_MS")? {
            config.cleanup_interval_ms = v;
        }
        if let Some(v) = parse_env("THUMBGRID_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = parse_env("THUMBGRID_THUMBNAIL_SIZE")? {
            config.thumbnail_size = v;
        }
        if let Ok(url) = std::env::var("THUMBGRID_SERVER_URL") {
            config.server_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (any subset of keys):
    /// ```toml
    /// max_cache_size = 1000
    /// max_concurrent_loads = 24
    /// viewport_lookahead_px = 200.0
    /// server_url = "http://127.0.0.1:8080"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the configuration cannot be serialized or written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}
