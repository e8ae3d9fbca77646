//! Transport backends: direct HTTP, Tor-routed HTTP and a headless browser.
//!
//! Every backend implements [`Transport`]. The per-request timeout overrides
//! everything else: a backend that has not produced a response strictly
//! before the limit returns [`TransportError::TimedOut`].
//!
//! # Modules
//!
//! - [`direct`]: `DirectHttp` (reqwest)
//! - [`tor`]: `TorHttp` (reqwest over SOCKS) + `TorControl` circuit rotation
//! - [`browser`]: `HeadlessBrowser` + `SessionGuard` (scoped session release)
//! - [`webdriver`]: W3C WebDriver client implementing `BrowserDriver`
//!
//! [`BackendSet::from_config`] builds and health-checks the configured set.

pub mod browser;
pub mod direct;
mod init;
pub mod tor;
pub mod webdriver;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use browser::{BrowserDriver, BrowserSession, HeadlessBrowser, RenderedContent, SessionGuard};
pub use direct::DirectHttp;
pub use tor::{CircuitRotator, StaticCircuit, TorControl, TorHttp};
pub use webdriver::WebDriverClient;

/// Which executor performed a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Direct,
    Tor,
    Browser,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Direct => "direct",
            BackendKind::Tor => "tor",
            BackendKind::Browser => "browser",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failures. Never reach the snapshot uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("timed out after {limit_ms}ms")]
    TimedOut { limit_ms: u64 },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("blocked by target: {0}")]
    Blocked(String),

    #[error("browser session acquisition failed: {0}")]
    SessionAcquisition(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A single fetch to perform.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub method: Method,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
    /// Script evaluated after page load (browser backend only).
    pub script: Option<String>,
}

impl TransportRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            method: Method::GET,
            timeout,
            headers: Vec::new(),
            script: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }
}

/// Raw output of a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    /// HTTP status; `None` for rendered browser content.
    pub status: Option<u16>,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub final_url: String,
    pub script_value: Option<serde_json::Value>,
}

impl RawResponse {
    /// Convenience constructor for an HTTP response.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            body: body.into(),
            ..Default::default()
        }
    }

    /// 2xx, or rendered browser content.
    pub fn is_success(&self) -> bool {
        self.status.map_or(true, |s| (200..300).contains(&s))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Uniform "execute a fetch" capability.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(&self, request: &TransportRequest) -> TransportResult<RawResponse>;

    /// Ask for a fresh network path before the next attempt.
    /// Only meaningful for Tor; other backends accept and ignore it.
    async fn rotate_circuit(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Run `fut` under `limit`.
///
/// The result counts only if it was produced strictly before the limit, so an
/// operation finishing exactly at the deadline is reported as `TimedOut`.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    let started = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(result) if started.elapsed() < limit => result,
        _ => Err(TransportError::TimedOut {
            limit_ms: limit.as_millis() as u64,
        }),
    }
}

/// Default CAPTCHA / bot-wall markers.
pub const DEFAULT_CAPTCHA_PATTERN: &str =
    r"(?i)captcha|cf-browser-verification|challenge-platform|are you a robot|unusual traffic";

/// Decide whether a response shows the target refusing service to this client.
///
/// 429 and 503 are treated as blocking, as is any body matching `captcha`.
pub fn block_reason(status: Option<u16>, body: &str, captcha: &Regex) -> Option<String> {
    match status {
        Some(429) => return Some("http 429 too many requests".to_string()),
        Some(503) => return Some("http 503 service unavailable".to_string()),
        _ => {}
    }
    captcha
        .find(body)
        .map(|m| format!("captcha marker {:?}", m.as_str()))
}

/// The backends available to a run, keyed by kind.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<BackendKind, Arc<dyn Transport>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn Transport>) -> Self {
        self.insert(backend);
        self
    }

    pub fn insert(&mut self, backend: Arc<dyn Transport>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn Transport>> {
        self.backends.get(&kind)
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.backends.keys().copied()
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}
