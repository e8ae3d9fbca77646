//! Headless-browser backend.
//!
//! Browser sessions are external OS processes, so every session is owned by a
//! [`SessionGuard`]. The guard closes the session when released and, if the
//! owning future is dropped first (attempt timeout, run deadline), from its
//! `Drop` impl on a detached task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    block_reason, bounded, BackendKind, RawResponse, Transport, TransportError, TransportRequest,
    TransportResult,
};

/// Upper bound for closing a session, independent of the request timeout.
pub(super) const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Page content after rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedContent {
    pub url: String,
    pub source: String,
    pub script_value: Option<serde_json::Value>,
}

/// Starts browser sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self) -> TransportResult<Box<dyn BrowserSession>>;
}

/// One live browser session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn id(&self) -> &str;

    /// Navigate to `url`, optionally evaluate `script`, return the rendered page.
    async fn fetch(&self, url: &Url, script: Option<&str>) -> TransportResult<RenderedContent>;

    async fn close(&self) -> TransportResult<()>;
}

async fn close_session(session: Box<dyn BrowserSession>) {
    let id = session.id().to_string();
    match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
        Ok(Ok(())) => debug!(session = %id, "browser session closed"),
        Ok(Err(e)) => warn!(session = %id, error = %e, "failed to close browser session"),
        Err(_) => warn!(session = %id, "timed out closing browser session"),
    }
}

/// Scoped ownership of a browser session.
pub struct SessionGuard {
    session: Option<Box<dyn BrowserSession>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn BrowserSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn session(&self) -> &dyn BrowserSession {
        // Only `release` and `drop` take the session, and both consume the guard.
        self.session
            .as_deref()
            .expect("session is present until the guard is consumed")
    }

    /// Close the session and wait for it.
    ///
    /// The close runs on its own task so it still completes if the caller
    /// is cancelled while waiting.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::spawn(close_session(session)).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_session(session));
            }
            Err(_) => warn!(
                session = %session.id(),
                "no runtime available, browser session leaked"
            ),
        }
    }
}

/// Fetches pages through a headless browser.
pub struct HeadlessBrowser {
    driver: Arc<dyn BrowserDriver>,
    captcha: Regex,
}

impl HeadlessBrowser {
    pub fn new(driver: Arc<dyn BrowserDriver>, captcha: Regex) -> Self {
        Self { driver, captcha }
    }
}

#[async_trait]
impl Transport for HeadlessBrowser {
    fn kind(&self) -> BackendKind {
        BackendKind::Browser
    }

    async fn execute(&self, request: &TransportRequest) -> TransportResult<RawResponse> {
        let deadline = Instant::now() + request.timeout;

        let session = bounded(request.timeout, self.driver.open_session()).await?;
        let guard = SessionGuard::new(session);
        debug!(session = %guard.session().id(), url = %request.url, "browser fetch");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let fetched = bounded(
            remaining,
            guard
                .session()
                .fetch(&request.url, request.script.as_deref()),
        )
        .await;
        guard.release().await;

        let content = fetched?;
        if let Some(reason) = block_reason(None, &content.source, &self.captcha) {
            return Err(TransportError::Blocked(reason));
        }
        Ok(RawResponse {
            status: None,
            headers: Vec::new(),
            body: content.source,
            final_url: content.url,
            script_value: content.script_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_CAPTCHA_PATTERN;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    struct StubSession {
        counters: Arc<Counters>,
        delay: Duration,
        page: String,
    }

    #[async_trait]
    impl BrowserSession for StubSession {
        fn id(&self) -> &str {
            "stub-session"
        }

        async fn fetch(&self, url: &Url, _script: Option<&str>) -> TransportResult<RenderedContent> {
            tokio::time::sleep(self.delay).await;
            Ok(RenderedContent {
                url: url.to_string(),
                source: self.page.clone(),
                script_value: Some(serde_json::json!(3)),
            })
        }

        async fn close(&self) -> TransportResult<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubDriver {
        counters: Arc<Counters>,
        delay: Duration,
        page: String,
        fail: bool,
    }

    #[async_trait]
    impl BrowserDriver for StubDriver {
        async fn open_session(&self) -> TransportResult<Box<dyn BrowserSession>> {
            if self.fail {
                return Err(TransportError::SessionAcquisition(
                    "browser binary crashed".to_string(),
                ));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                counters: Arc::clone(&self.counters),
                delay: self.delay,
                page: self.page.clone(),
            }))
        }
    }

    fn browser(delay: Duration, page: &str, fail: bool) -> (HeadlessBrowser, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let driver = StubDriver {
            counters: Arc::clone(&counters),
            delay,
            page: page.to_string(),
            fail,
        };
        (
            HeadlessBrowser::new(
                Arc::new(driver),
                Regex::new(DEFAULT_CAPTCHA_PATTERN).unwrap(),
            ),
            counters,
        )
    }

    fn request(timeout: Duration) -> TransportRequest {
        TransportRequest::get(
            Url::parse("https://searx.example/search?q=time").unwrap(),
            timeout,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_closes_session() {
        let (backend, counters) = browser(Duration::from_millis(10), "<html>ok</html>", false);
        let response = backend.execute(&request(Duration::from_secs(1))).await.unwrap();

        assert_eq!(response.status, None);
        assert_eq!(response.script_value, Some(serde_json::json!(3)));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_closes_session() {
        let (backend, counters) = browser(Duration::from_secs(30), "<html>ok</html>", false);
        let result = backend.execute(&request(Duration::from_secs(1))).await;

        assert!(matches!(result, Err(TransportError::TimedOut { .. })));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_closes_session() {
        let (backend, counters) = browser(Duration::from_secs(30), "<html>ok</html>", false);
        let backend = Arc::new(backend);

        let task = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.execute(&request(Duration::from_secs(60))).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        task.abort();
        let _ = task.await;
        // Let the detached close task run.
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_acquisition_failure() {
        let (backend, counters) = browser(Duration::ZERO, "", true);
        let result = backend.execute(&request(Duration::from_secs(1))).await;

        assert!(matches!(result, Err(TransportError::SessionAcquisition(_))));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_captcha_page_is_blocked() {
        let (backend, counters) = browser(
            Duration::ZERO,
            "<div class=\"h-captcha\">prove it</div>",
            false,
        );
        let result = backend.execute(&request(Duration::from_secs(1))).await;

        assert!(matches!(result, Err(TransportError::Blocked(_))));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }
}
