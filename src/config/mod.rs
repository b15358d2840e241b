//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Serde defaults for every field, so partial JSON files are valid
//! - JSON loading from strings or files
//! - Environment overrides for deployment knobs
//! - Validation of values the runtime cannot work with

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::cache::CacheConfig;
use crate::modules::limiter::LimiterConfig;
use crate::modules::metrics::MetricsConfig;
use crate::modules::proxy::ProxyConfig;
use crate::modules::retry::RetryPolicy;
use crate::modules::timing::DelayRange;
use crate::session::WaitUntil;

pub const ENV_PROXIES: &str = "PRODUCT_SCRAPER_PROXIES";
pub const ENV_MAX_ATTEMPTS: &str = "PRODUCT_SCRAPER_MAX_ATTEMPTS";
pub const ENV_CACHE_TTL_SECS: &str = "PRODUCT_SCRAPER_CACHE_TTL_SECS";
pub const ENV_MAX_CONCURRENT: &str = "PRODUCT_SCRAPER_MAX_CONCURRENT";
pub const ENV_RESERVOIR: &str = "PRODUCT_SCRAPER_RESERVOIR";
pub const ENV_SCREENSHOT_DIR: &str = "PRODUCT_SCRAPER_SCREENSHOT_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// (De)serialises a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// URL fragments identifying the two data endpoints and any extra
/// challenge pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub product_detail: String,
    pub benefits: String,
    pub challenge_patterns: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            product_detail: "/api/v4/pdp/get_pc".into(),
            benefits: "/api/v4/pdp/get_benefits".into(),
            challenge_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    pub step_px: u64,
    pub interval: DelayRange,
    pub max_steps: u32,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            step_px: 100,
            interval: DelayRange::from_millis(100, 100),
            max_steps: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoints: EndpointConfig,
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub navigation_timeout: Duration,
    pub wait_until: WaitUntil,
    pub pre_navigation_delay: DelayRange,
    pub post_capture_delay: DelayRange,
    pub scroll: ScrollConfig,
    #[serde(with = "duration_ms")]
    pub network_idle_timeout: Duration,
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointConfig::default(),
            response_timeout: Duration::from_secs(60),
            navigation_timeout: Duration::from_secs(60),
            wait_until: WaitUntil::DomContentLoaded,
            pre_navigation_delay: DelayRange::from_millis(500, 1500),
            post_capture_delay: DelayRange::from_millis(1000, 2500),
            scroll: ScrollConfig::default(),
            network_idle_timeout: Duration::from_secs(5),
            screenshot_dir: Some(PathBuf::from("screenshots")),
        }
    }
}

/// Top-level configuration consumed by [`crate::ProductScraperBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub proxies: Vec<String>,
    pub proxy: ProxyConfig,
    pub limiter: LimiterConfig,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub pre_request_delay: DelayRange,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            proxy: ProxyConfig::default(),
            limiter: LimiterConfig::default(),
            retry: RetryPolicy::default(),
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
            pre_request_delay: DelayRange::from_millis(1000, 3000),
        }
    }
}

impl ScraperConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ScraperConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        ScraperConfig::default().with_env_overrides(std::env::vars())
    }

    /// Applies recognised `PRODUCT_SCRAPER_*` variables; others are ignored.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                ENV_PROXIES => {
                    self.proxies = value
                        .split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(String::from)
                        .collect();
                }
                ENV_MAX_ATTEMPTS => self.retry.max_attempts = parse_number(key, value)?,
                ENV_CACHE_TTL_SECS => {
                    self.cache.ttl = Duration::from_secs(parse_number(key, value)?);
                }
                ENV_MAX_CONCURRENT => self.limiter.max_concurrent = parse_number(key, value)?,
                ENV_RESERVOIR => self.limiter.reservoir = parse_number(key, value)?,
                ENV_SCREENSHOT_DIR => {
                    self.session.screenshot_dir =
                        (!value.is_empty()).then(|| PathBuf::from(value));
                }
                _ => {}
            }
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.retry.blocked_delay.is_zero() && self.retry.blocked_delay >= self.retry.backoff_base {
            return Err(ConfigError::invalid(
                "retry.blocked_delay",
                "must be shorter than retry.backoff_base",
            ));
        }
        if self.limiter.max_concurrent == 0 {
            return Err(ConfigError::invalid("limiter.max_concurrent", "must be at least 1"));
        }
        if self.limiter.reservoir == 0 {
            return Err(ConfigError::invalid("limiter.reservoir", "must be at least 1"));
        }
        if self.limiter.refill_interval.is_zero() {
            return Err(ConfigError::invalid("limiter.refill_interval", "must be non-zero"));
        }
        if self.metrics.capacity == 0 {
            return Err(ConfigError::invalid("metrics.capacity", "must be at least 1"));
        }
        if self.session.endpoints.product_detail.is_empty() || self.session.endpoints.benefits.is_empty() {
            return Err(ConfigError::invalid("session.endpoints", "endpoint patterns must not be empty"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| ConfigError::invalid(key, format!("'{value}': {err}")))
}
