//! In-memory fakes for the transport traits (testing only).
//!
//! [`ScriptedTransport`] replays canned replies per host and counts every
//! invocation; [`CountingRotator`] stands in for the Tor control port.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use crate::transport::{
    bounded, BackendKind, CircuitRotator, RawResponse, Transport, TransportError,
    TransportRequest, TransportResult,
};

/// A page every check kind can make sense of: it looks like a searx
/// instance and carries two result blocks.
pub const HEALTHY_PAGE: &str = r#"<html><head><meta name="generator" content="searxng/2024.5.1"><title>SearXNG</title></head>
<body><div id="urls"><article class="result result-default">one</article><article class="result">two</article></div></body></html>"#;

/// One canned backend reaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Respond {
        status: Option<u16>,
        body: String,
        script_value: Option<Value>,
        delay: Duration,
    },
    Fail {
        error: TransportError,
        delay: Duration,
    },
}

impl Reply {
    /// HTTP 200 with `body`.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Reply::Respond {
            status: Some(status),
            body: body.into(),
            script_value: None,
            delay: Duration::ZERO,
        }
    }

    pub fn error(error: TransportError) -> Self {
        Reply::Fail {
            error,
            delay: Duration::ZERO,
        }
    }

    /// Same reply, produced after `delay`.
    pub fn after(mut self, wait: Duration) -> Self {
        match &mut self {
            Reply::Respond { delay, .. } | Reply::Fail { delay, .. } => *delay = wait,
        }
        self
    }

    fn delay(&self) -> Duration {
        match self {
            Reply::Respond { delay, .. } | Reply::Fail { delay, .. } => *delay,
        }
    }
}

#[derive(Default)]
struct InFlight {
    current: HashMap<String, usize>,
    max_per_host: usize,
    total: usize,
    max_total: usize,
}

/// Stub [`Transport`] with per-host reply queues.
///
/// Queues are keyed by `host` or by `host` + path (e.g. `a.example/config`);
/// the longer key wins. Each call pops the front reply, except the last one,
/// which repeats. Unscripted hosts get [`HEALTHY_PAGE`].
pub struct ScriptedTransport {
    kind: BackendKind,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: AtomicUsize,
    calls_by_url: Mutex<HashMap<String, usize>>,
    rotations: AtomicUsize,
    in_flight: Mutex<InFlight>,
}

impl ScriptedTransport {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            calls_by_url: Mutex::new(HashMap::new()),
            rotations: AtomicUsize::new(0),
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    /// Builder form of [`ScriptedTransport::script`].
    pub fn with_script<I>(self, target: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = Reply>,
    {
        self.script(target, replies);
        self
    }

    /// Append `replies` to the queue for `target`.
    pub fn script<I>(&self, target: &str, replies: I)
    where
        I: IntoIterator<Item = Reply>,
    {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .entry(target.trim_end_matches('/').to_string())
            .or_default()
            .extend(replies);
    }

    /// Total `execute` invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invocations whose URL host is `host`.
    pub fn calls_for_host(&self, host: &str) -> usize {
        let by_url = self.calls_by_url.lock().unwrap();
        by_url
            .iter()
            .filter(|(url, _)| {
                Url::parse(url)
                    .map(|u| u.host_str() == Some(host))
                    .unwrap_or(false)
            })
            .map(|(_, n)| n)
            .sum()
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls against one host.
    pub fn max_in_flight_per_host(&self) -> usize {
        self.in_flight.lock().unwrap().max_per_host
    }

    /// Highest number of simultaneous calls overall.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().max_total
    }

    fn next_reply(&self, url: &Url) -> Reply {
        let host = url.host_str().unwrap_or_default();
        let with_path = format!("{host}{}", url.path().trim_end_matches('/'));
        let mut scripts = self.scripts.lock().unwrap();
        let target = if scripts.contains_key(&with_path) {
            with_path.as_str()
        } else {
            host
        };
        let reply = scripts.get_mut(target).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        reply.unwrap_or_else(|| Reply::ok(HEALTHY_PAGE))
    }

    fn enter(&self, host: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let current = in_flight.current.entry(host.to_string()).or_default();
        *current += 1;
        let current = *current;
        in_flight.max_per_host = in_flight.max_per_host.max(current);
        in_flight.total += 1;
        in_flight.max_total = in_flight.max_total.max(in_flight.total);
    }

    fn leave(&self, host: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(current) = in_flight.current.get_mut(host) {
            *current = current.saturating_sub(1);
        }
        in_flight.total = in_flight.total.saturating_sub(1);
    }
}

/// Decrements the in-flight counters even when the call is cancelled.
struct CallGuard<'a> {
    transport: &'a ScriptedTransport,
    host: String,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.transport.leave(&self.host);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn execute(&self, request: &TransportRequest) -> TransportResult<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_url
            .lock()
            .unwrap()
            .entry(request.url.to_string())
            .or_default() += 1;

        let host = request.url.host_str().unwrap_or_default().to_string();
        self.enter(&host);
        let _guard = CallGuard {
            transport: self,
            host,
        };

        let reply = self.next_reply(&request.url);
        let final_url = request.url.to_string();
        bounded(request.timeout, async move {
            tokio::time::sleep(reply.delay()).await;
            match reply {
                Reply::Respond {
                    status,
                    body,
                    script_value,
                    ..
                } => Ok(RawResponse {
                    status,
                    headers: Vec::new(),
                    body,
                    final_url,
                    script_value,
                }),
                Reply::Fail { error, .. } => Err(error),
            }
        })
        .await
    }

    async fn rotate_circuit(&self) -> TransportResult<()> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory [`CircuitRotator`] that counts rotations.
#[derive(Debug, Default)]
pub struct CountingRotator {
    rotations: AtomicUsize,
}

impl CountingRotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CircuitRotator for CountingRotator {
    async fn rotate(&self) -> TransportResult<()> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
