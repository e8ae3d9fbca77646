//! Run configuration.
//!
//! Layered in this order, later layers winning: built-in defaults, a TOML
//! file, `SEARXSTATS_*` environment variables, then command-line flags
//! (applied by the binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::check::{CapabilityParams, CheckKind, CorrectnessParams, LivenessParams};
use crate::error::{ConfigError, ConfigResult};
use crate::scheduler::{BackendPolicy, RetryPolicy};
use crate::transport::DEFAULT_CAPTCHA_PATTERN;

pub const ENV_CONCURRENCY: &str = "SEARXSTATS_CONCURRENCY";
pub const ENV_TOR_SOCKS: &str = "SEARXSTATS_TOR_SOCKS";
pub const ENV_TOR_CONTROL: &str = "SEARXSTATS_TOR_CONTROL";
pub const ENV_TOR_PASSWORD: &str = "SEARXSTATS_TOR_PASSWORD";
pub const ENV_WEBDRIVER_URL: &str = "SEARXSTATS_WEBDRIVER_URL";
pub const ENV_CACHE_DIR: &str = "SEARXSTATS_CACHE_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub backends: BackendsConfig,
    pub checks: ChecksConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum attempts in flight at once.
    pub concurrency: usize,
    /// Limit for a single attempt (milliseconds).
    pub attempt_timeout_ms: u64,
    /// Wall-clock budget for the whole run; unbounded when absent.
    pub run_deadline_secs: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            attempt_timeout_ms: 20_000,
            run_deadline_secs: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Directory for the file-backed store; in-memory when absent.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Whether clearnet instances may be fetched without Tor.
    pub allow_direct: bool,
    pub user_agent: String,
    pub captcha_pattern: String,
    pub tor: Option<TorConfig>,
    pub browser: Option<BrowserConfig>,
    pub preferences: BackendPolicy,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            allow_direct: true,
            user_agent: format!("searxstats/{}", env!("CARGO_PKG_VERSION")),
            captcha_pattern: DEFAULT_CAPTCHA_PATTERN.to_string(),
            tor: None,
            browser: None,
            preferences: BackendPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub socks_addr: String,
    /// Control port; circuit rotation is unavailable without it.
    pub control_addr: Option<String>,
    pub control_password: Option<String>,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            socks_addr: "127.0.0.1:9050".to_string(),
            control_addr: Some("127.0.0.1:9051".to_string()),
            control_password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub browser_name: String,
    pub page_load_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://127.0.0.1:4444".to_string(),
            browser_name: "firefox".to_string(),
            page_load_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub enabled: Vec<CheckKind>,
    pub liveness: LivenessParams,
    pub capability: CapabilityParams,
    pub correctness: CorrectnessParams,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            enabled: CheckKind::ALL.to_vec(),
            liveness: LivenessParams::default(),
            capability: CapabilityParams::default(),
            correctness: CorrectnessParams::default(),
        }
    }
}

impl ProbeConfig {
    /// Parse a TOML document. Missing tables and keys take their defaults.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Apply `SEARXSTATS_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_vars<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            self.scheduler.concurrency = raw
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(ENV_CONCURRENCY, &e.to_string()))?;
        }
        if let Some(addr) = lookup(ENV_TOR_SOCKS) {
            self.backends.tor.get_or_insert_with(TorConfig::default).socks_addr = addr;
        }
        if let Some(addr) = lookup(ENV_TOR_CONTROL) {
            self.backends
                .tor
                .get_or_insert_with(TorConfig::default)
                .control_addr = Some(addr);
        }
        if let Some(password) = lookup(ENV_TOR_PASSWORD) {
            self.backends
                .tor
                .get_or_insert_with(TorConfig::default)
                .control_password = Some(password);
        }
        if let Some(url) = lookup(ENV_WEBDRIVER_URL) {
            self.backends
                .browser
                .get_or_insert_with(BrowserConfig::default)
                .webdriver_url = url;
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scheduler.concurrency == 0 {
            return Err(invalid("scheduler.concurrency", "must be at least 1"));
        }
        if self.scheduler.attempt_timeout_ms == 0 {
            return Err(invalid("scheduler.attempt_timeout_ms", "must be positive"));
        }
        if self.scheduler.run_deadline_secs == Some(0) {
            return Err(invalid("scheduler.run_deadline_secs", "must be positive"));
        }
        self.scheduler.retry.validate()?;
        if self.checks.enabled.is_empty() {
            return Err(invalid("checks.enabled", "no check kinds enabled"));
        }
        if self.checks.correctness.min_results == 0 {
            return Err(invalid("checks.correctness.min_results", "must be at least 1"));
        }
        if let Some(tor) = &self.backends.tor {
            if tor.socks_addr.trim().is_empty() {
                return Err(invalid("backends.tor.socks_addr", "must not be empty"));
            }
        }
        if let Some(browser) = &self.backends.browser {
            if reqwest::Url::parse(&browser.webdriver_url).is_err() {
                return Err(invalid("backends.browser.webdriver_url", "not a valid url"));
            }
        }
        regex::Regex::new(&self.backends.captcha_pattern).map_err(|source| {
            ConfigError::InvalidRegex {
                field: "backends.captcha_pattern".to_string(),
                source,
            }
        })?;
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
