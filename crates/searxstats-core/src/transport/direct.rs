//! Plain HTTP backend.

use async_trait::async_trait;
use tracing::debug;

use super::{
    bounded, BackendKind, RawResponse, Transport, TransportError, TransportRequest,
    TransportResult,
};

/// Direct HTTP client.
///
/// The request future is dropped when the timeout fires, which cancels the
/// in-flight request and releases its connection.
pub struct DirectHttp {
    client: reqwest::Client,
}

impl DirectHttp {
    pub fn new(user_agent: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::ProtocolError(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for DirectHttp {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn execute(&self, request: &TransportRequest) -> TransportResult<RawResponse> {
        debug!(url = %request.url, "direct fetch");
        bounded(request.timeout, send(&self.client, request)).await
    }
}

/// Issue `request` on `client` and read the full body.
pub(crate) async fn send(
    client: &reqwest::Client,
    request: &TransportRequest,
) -> TransportResult<RawResponse> {
    let limit_ms = request.timeout.as_millis() as u64;
    let mut builder = client
        .request(request.method.clone(), request.url.clone())
        .timeout(request.timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| classify_reqwest(e, limit_ms))?;

    let status = response.status().as_u16();
    let final_url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_ascii_lowercase(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .text()
        .await
        .map_err(|e| classify_reqwest(e, limit_ms))?;

    Ok(RawResponse {
        status: Some(status),
        headers,
        body,
        final_url,
        script_value: None,
    })
}

pub(crate) fn classify_reqwest(err: reqwest::Error, limit_ms: u64) -> TransportError {
    if err.is_timeout() {
        TransportError::TimedOut { limit_ms }
    } else if err.is_connect() {
        TransportError::ConnectFailed(err.to_string())
    } else {
        TransportError::ProtocolError(err.to_string())
    }
}
