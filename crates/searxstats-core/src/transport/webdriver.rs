//! Minimal W3C WebDriver client (geckodriver, chromedriver, selenium).
//!
//! Only the endpoints the prober needs: status, new session, navigate,
//! execute script, page source, delete session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::browser::{BrowserDriver, BrowserSession, RenderedContent, CLOSE_TIMEOUT};
use super::{TransportError, TransportResult};

/// WebDriver endpoint plus the capabilities used for new sessions.
#[derive(Debug, Clone)]
pub struct WebDriverClient {
    http: reqwest::Client,
    endpoint: String,
    capabilities: Value,
    page_load_timeout: Duration,
}

impl WebDriverClient {
    /// `endpoint` is the WebDriver base URL, e.g. `http://127.0.0.1:4444`.
    pub fn new(
        endpoint: &str,
        browser_name: &str,
        page_load_timeout: Duration,
    ) -> TransportResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::ProtocolError(format!("webdriver client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            capabilities: headless_capabilities(browser_name),
            page_load_timeout,
        })
    }

    /// Whether the WebDriver server reports itself ready for new sessions.
    pub async fn ready(&self) -> TransportResult<bool> {
        let value = call(self.http.get(format!("{}/status", self.endpoint))).await?;
        Ok(value["ready"].as_bool().unwrap_or(false))
    }
}

fn headless_capabilities(browser_name: &str) -> Value {
    match browser_name {
        "chrome" | "chromium" => json!({
            "browserName": "chrome",
            "goog:chromeOptions": { "args": ["--headless=new", "--disable-gpu", "--no-sandbox"] }
        }),
        other => json!({
            "browserName": other,
            "moz:firefoxOptions": { "args": ["-headless"] }
        }),
    }
}

/// Send a WebDriver command and unwrap the `value` member of the reply.
async fn call(builder: reqwest::RequestBuilder) -> TransportResult<Value> {
    let response = builder.send().await.map_err(|e| {
        if e.is_connect() {
            TransportError::ConnectFailed(format!("webdriver: {e}"))
        } else {
            TransportError::ProtocolError(format!("webdriver: {e}"))
        }
    })?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| TransportError::ProtocolError(format!("webdriver reply: {e}")))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    let error = value["error"].as_str().unwrap_or("unknown error");
    let message = value["message"].as_str().unwrap_or("");
    Err(classify_webdriver_error(error, message))
}

/// Map a WebDriver error code and message to a transport error.
fn classify_webdriver_error(error: &str, message: &str) -> TransportError {
    let detail = format!("{error}: {message}");
    if error == "timeout" || error == "script timeout" {
        return TransportError::TimedOut { limit_ms: 0 };
    }
    if error == "invalid session id" || error == "session not created" {
        return TransportError::SessionAcquisition(detail);
    }
    let unreachable = [
        "ERR_NAME_NOT_RESOLVED",
        "ERR_CONNECTION",
        "ERR_ADDRESS_UNREACHABLE",
        "dnsNotFound",
        "connectionFailure",
        "netTimeout",
    ];
    if unreachable.iter().any(|marker| message.contains(marker)) {
        return TransportError::ConnectFailed(detail);
    }
    TransportError::ProtocolError(detail)
}

impl WebDriverClient {
    /// POST /session, then apply the page-load timeout.
    ///
    /// A session that fails the second step is closed before returning.
    async fn create_session(&self) -> TransportResult<WebDriverSession> {
        let body = json!({ "capabilities": { "alwaysMatch": self.capabilities } });
        let value = call(
            self.http
                .post(format!("{}/session", self.endpoint))
                .json(&body),
        )
        .await
        .map_err(|e| TransportError::SessionAcquisition(e.to_string()))?;

        let id = value["sessionId"]
            .as_str()
            .ok_or_else(|| {
                TransportError::SessionAcquisition("reply carries no sessionId".to_string())
            })?
            .to_string();
        let session = WebDriverSession {
            http: self.http.clone(),
            base: format!("{}/session/{}", self.endpoint, id),
            id,
            closed: AtomicBool::new(false),
        };
        debug!(session = %session.id, "opened webdriver session");

        let timeouts = json!({ "pageLoad": self.page_load_timeout.as_millis() as u64 });
        if let Err(e) = call(
            session
                .http
                .post(format!("{}/timeouts", session.base))
                .json(&timeouts),
        )
        .await
        {
            let _ = session.close().await;
            return Err(TransportError::SessionAcquisition(e.to_string()));
        }
        Ok(session)
    }
}

#[async_trait]
impl BrowserDriver for WebDriverClient {
    /// Acquisition runs on its own task. If the caller is dropped first, the
    /// task still finishes and the session it produced is closed on drop.
    async fn open_session(&self) -> TransportResult<Box<dyn BrowserSession>> {
        let client = self.clone();
        match tokio::spawn(async move { client.create_session().await }).await {
            Ok(session) => Ok(Box::new(session?)),
            Err(e) => Err(TransportError::SessionAcquisition(format!(
                "session task failed: {e}"
            ))),
        }
    }
}

/// A remote session. Dropping it without [`BrowserSession::close`] sends the
/// DELETE from a detached task.
struct WebDriverSession {
    http: reqwest::Client,
    base: String,
    id: String,
    closed: AtomicBool,
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let request = self.http.delete(&self.base);
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match tokio::time::timeout(CLOSE_TIMEOUT, call(request)).await {
                        Ok(Ok(_)) => debug!(session = %id, "closed dropped webdriver session"),
                        Ok(Err(e)) => {
                            warn!(session = %id, error = %e, "failed to close dropped session")
                        }
                        Err(_) => warn!(session = %id, "timed out closing dropped session"),
                    }
                });
            }
            Err(_) => warn!(session = %id, "no runtime available, webdriver session leaked"),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, url: &Url, script: Option<&str>) -> TransportResult<RenderedContent> {
        call(
            self.http
                .post(format!("{}/url", self.base))
                .json(&json!({ "url": url.as_str() })),
        )
        .await?;

        let script_value = match script {
            Some(script) => Some(
                call(
                    self.http
                        .post(format!("{}/execute/sync", self.base))
                        .json(&json!({ "script": script, "args": [] })),
                )
                .await?,
            ),
            None => None,
        };

        let source = call(self.http.get(format!("{}/source", self.base))).await?;
        let current = call(self.http.get(format!("{}/url", self.base))).await?;

        Ok(RenderedContent {
            url: current.as_str().unwrap_or(url.as_str()).to_string(),
            source: source.as_str().unwrap_or_default().to_string(),
            script_value,
        })
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        call(self.http.delete(&self.base)).await?;
        Ok(())
    }
}
