//! Tor-routed HTTP backend and circuit rotation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::direct::send;
use super::{
    block_reason, bounded, BackendKind, RawResponse, Transport, TransportError, TransportRequest,
    TransportResult,
};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can hand out a fresh Tor circuit.
#[async_trait]
pub trait CircuitRotator: Send + Sync {
    async fn rotate(&self) -> TransportResult<()>;
}

/// Rotates circuits through the Tor control port (`SIGNAL NEWNYM`).
#[derive(Debug, Clone)]
pub struct TorControl {
    addr: String,
    password: Option<String>,
}

impl TorControl {
    pub fn new(addr: impl Into<String>, password: Option<String>) -> Self {
        Self {
            addr: addr.into(),
            password,
        }
    }

    async fn command(
        stream: &mut BufReader<TcpStream>,
        line: &str,
        what: &str,
    ) -> TransportResult<()> {
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::ProtocolError(format!("tor control write: {e}")))?;

        let mut reply = String::new();
        stream
            .read_line(&mut reply)
            .await
            .map_err(|e| TransportError::ProtocolError(format!("tor control read: {e}")))?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(TransportError::ProtocolError(format!(
                "tor control {what} rejected: {}",
                reply.trim_end()
            )))
        }
    }
}

#[async_trait]
impl CircuitRotator for TorControl {
    async fn rotate(&self) -> TransportResult<()> {
        bounded(CONTROL_TIMEOUT, async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| TransportError::ConnectFailed(format!("tor control: {e}")))?;
            let mut stream = BufReader::new(stream);

            let auth = match &self.password {
                Some(password) => format!(
                    "AUTHENTICATE \"{}\"\r\n",
                    password.replace('\\', "\\\\").replace('"', "\\\"")
                ),
                None => "AUTHENTICATE\r\n".to_string(),
            };
            Self::command(&mut stream, &auth, "AUTHENTICATE").await?;
            Self::command(&mut stream, "SIGNAL NEWNYM\r\n", "NEWNYM").await?;
            let _ = stream.get_mut().write_all(b"QUIT\r\n").await;
            Ok(())
        })
        .await?;

        info!(control = %self.addr, "Requested new tor circuit");
        Ok(())
    }
}

/// Rotator used when no control port is configured: rotation is accepted
/// and the circuit stays as it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCircuit;

#[async_trait]
impl CircuitRotator for StaticCircuit {
    async fn rotate(&self) -> TransportResult<()> {
        debug!("no tor control port configured, circuit not rotated");
        Ok(())
    }
}

/// HTTP over a local Tor SOCKS proxy.
pub struct TorHttp {
    client: reqwest::Client,
    rotator: Arc<dyn CircuitRotator>,
    captcha: Regex,
}

impl TorHttp {
    /// `socks_addr` is `host:port` of the Tor SOCKS listener.
    ///
    /// Idle connections are not pooled: a pooled connection would keep using
    /// the circuit it was opened on after a rotation.
    pub fn new(
        socks_addr: &str,
        user_agent: &str,
        rotator: Arc<dyn CircuitRotator>,
        captcha: Regex,
    ) -> TransportResult<Self> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{socks_addr}"))
            .map_err(|e| TransportError::ProtocolError(format!("tor proxy: {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .proxy(proxy)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| TransportError::ProtocolError(format!("http client: {e}")))?;
        Ok(Self {
            client,
            rotator,
            captcha,
        })
    }

    /// Interpret an HTTP response seen through Tor: exit nodes that are
    /// rate limited or captcha-walled come back as `Blocked`.
    fn classify(&self, response: RawResponse) -> TransportResult<RawResponse> {
        match block_reason(response.status, &response.body, &self.captcha) {
            Some(reason) => Err(TransportError::Blocked(reason)),
            None => Ok(response),
        }
    }
}

#[async_trait]
impl Transport for TorHttp {
    fn kind(&self) -> BackendKind {
        BackendKind::Tor
    }

    async fn execute(&self, request: &TransportRequest) -> TransportResult<RawResponse> {
        debug!(url = %request.url, "tor fetch");
        let response = bounded(request.timeout, send(&self.client, request)).await?;
        self.classify(response)
    }

    async fn rotate_circuit(&self) -> TransportResult<()> {
        self.rotator.rotate().await
    }
}
