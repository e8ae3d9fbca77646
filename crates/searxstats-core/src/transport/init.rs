//! Build the backend set for a run from configuration.
//!
//! Configured backends are checked before any instance is probed: the Tor
//! SOCKS port has to accept a connection and the WebDriver server has to
//! report ready. Either failure aborts the run with
//! [`ProbeError::BackendInit`].

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tracing::info;

use super::{
    BackendKind, BackendSet, CircuitRotator, DirectHttp, HeadlessBrowser, StaticCircuit,
    TorControl, TorHttp, WebDriverClient,
};
use crate::config::{BackendsConfig, BrowserConfig, TorConfig};
use crate::error::{ConfigError, ProbeError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn init_error(backend: BackendKind, reason: impl Into<String>) -> ProbeError {
    ProbeError::BackendInit {
        backend: backend.to_string(),
        reason: reason.into(),
    }
}

impl BackendSet {
    /// Initialize every backend the configuration enables.
    pub async fn from_config(config: &BackendsConfig) -> Result<Self> {
        let captcha =
            Regex::new(&config.captcha_pattern).map_err(|source| ConfigError::InvalidRegex {
                field: "backends.captcha_pattern".to_string(),
                source,
            })?;

        let mut backends = BackendSet::new();
        if config.allow_direct {
            let direct = DirectHttp::new(&config.user_agent)
                .map_err(|e| init_error(BackendKind::Direct, e.to_string()))?;
            backends.insert(Arc::new(direct));
        }
        if let Some(tor) = &config.tor {
            backends.insert(Arc::new(
                init_tor(tor, &config.user_agent, captcha.clone()).await?,
            ));
        }
        if let Some(browser) = &config.browser {
            backends.insert(Arc::new(init_browser(browser, captcha).await?));
        }

        if backends.kinds().next().is_none() {
            return Err(ProbeError::BackendInit {
                backend: "any".to_string(),
                reason: "direct access is disabled and no tor or browser backend is configured"
                    .to_string(),
            });
        }
        info!(backends = ?backends, "Backends initialized");
        Ok(backends)
    }
}

async fn init_tor(config: &TorConfig, user_agent: &str, captcha: Regex) -> Result<TorHttp> {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&config.socks_addr)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            return Err(init_error(
                BackendKind::Tor,
                format!("socks port {} refused: {e}", config.socks_addr),
            ))
        }
        Err(_) => {
            return Err(init_error(
                BackendKind::Tor,
                format!("socks port {} did not answer", config.socks_addr),
            ))
        }
    }

    let rotator: Arc<dyn CircuitRotator> = match &config.control_addr {
        Some(addr) => Arc::new(TorControl::new(addr.clone(), config.control_password.clone())),
        None => Arc::new(StaticCircuit),
    };
    TorHttp::new(&config.socks_addr, user_agent, rotator, captcha)
        .map_err(|e| init_error(BackendKind::Tor, e.to_string()))
}

async fn init_browser(config: &BrowserConfig, captcha: Regex) -> Result<HeadlessBrowser> {
    let client = WebDriverClient::new(
        &config.webdriver_url,
        &config.browser_name,
        Duration::from_millis(config.page_load_timeout_ms),
    )
    .map_err(|e| init_error(BackendKind::Browser, e.to_string()))?;

    let ready = match tokio::time::timeout(PROBE_TIMEOUT, client.ready()).await {
        Ok(result) => result.map_err(|e| init_error(BackendKind::Browser, e.to_string()))?,
        Err(_) => return Err(init_error(BackendKind::Browser, "webdriver status timed out")),
    };
    if !ready {
        return Err(init_error(
            BackendKind::Browser,
            format!("webdriver at {} is not ready", config.webdriver_url),
        ));
    }
    Ok(HeadlessBrowser::new(Arc::new(client), captcha))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    /// Serve a single WebDriver `/status` reply.
    async fn status_server(ready: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let body = format!(r#"{{"value":{{"ready":{ready},"message":"status"}}}}"#);
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_direct_only() {
        let backends = BackendSet::from_config(&BackendsConfig::default())
            .await
            .unwrap();
        assert_eq!(backends.kinds().collect::<Vec<_>>(), vec![BackendKind::Direct]);
    }

    #[tokio::test]
    async fn test_nothing_enabled_is_error() {
        let config = BackendsConfig {
            allow_direct: false,
            ..Default::default()
        };
        let err = BackendSet::from_config(&config).await.unwrap_err();
        assert!(matches!(err, ProbeError::BackendInit { .. }));
    }

    #[tokio::test]
    async fn test_tor_socks_closed_is_init_error() {
        let config = BackendsConfig {
            tor: Some(TorConfig {
                socks_addr: closed_port().await,
                control_addr: None,
                control_password: None,
            }),
            ..Default::default()
        };
        let err = BackendSet::from_config(&config).await.unwrap_err();
        match err {
            ProbeError::BackendInit { backend, .. } => assert_eq!(backend, "tor"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tor_socks_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BackendsConfig {
            allow_direct: false,
            tor: Some(TorConfig {
                socks_addr: listener.local_addr().unwrap().to_string(),
                control_addr: None,
                control_password: None,
            }),
            ..Default::default()
        };
        let backends = BackendSet::from_config(&config).await.unwrap();
        assert!(backends.contains(BackendKind::Tor));
        assert!(!backends.contains(BackendKind::Direct));
    }

    #[tokio::test]
    async fn test_webdriver_not_ready_is_init_error() {
        let config = BackendsConfig {
            browser: Some(BrowserConfig {
                webdriver_url: status_server(false).await,
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = BackendSet::from_config(&config).await.unwrap_err();
        match err {
            ProbeError::BackendInit { backend, reason } => {
                assert_eq!(backend, "browser");
                assert!(reason.contains("not ready"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_webdriver_ready() {
        let config = BackendsConfig {
            browser: Some(BrowserConfig {
                webdriver_url: status_server(true).await,
                ..Default::default()
            }),
            ..Default::default()
        };
        let backends = BackendSet::from_config(&config).await.unwrap();
        assert!(backends.contains(BackendKind::Browser));
        assert!(backends.contains(BackendKind::Direct));
    }

    #[tokio::test]
    async fn test_bad_captcha_pattern_is_config_error() {
        let config = BackendsConfig {
            captcha_pattern: "([".to_string(),
            ..Default::default()
        };
        let err = BackendSet::from_config(&config).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(ConfigError::InvalidRegex { .. })));
    }
}
