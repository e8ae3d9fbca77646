//! Liveness: is there a searx instance answering at this URL?

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use super::{
    retryable_status, transport_failure, CheckKind, CheckOutcome, CheckResult, CheckRunner,
    FailureKind,
};
use crate::error::{ConfigError, ConfigResult};
use crate::fingerprint::Fingerprint;
use crate::instance::Instance;
use crate::transport::{RawResponse, Transport, TransportRequest};

/// Version advertised in the page's `generator` meta tag.
static GENERATOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+name=["']generator["'][^>]+content=["']searx(?:ng)?/([^"']+)["']"#)
        .expect("generator regex should compile")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessParams {
    /// Path fetched relative to the instance base URL.
    pub path: String,
    /// Regex the body must match for the URL to count as an instance.
    pub marker: String,
}

impl Default for LivenessParams {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            marker: "(?i)searx".to_string(),
        }
    }
}

pub struct Liveness {
    params: LivenessParams,
    marker: Regex,
}

impl Liveness {
    pub fn new(params: LivenessParams) -> ConfigResult<Self> {
        let marker = Regex::new(&params.marker).map_err(|source| ConfigError::InvalidRegex {
            field: "checks.liveness.marker".to_string(),
            source,
        })?;
        Ok(Self { params, marker })
    }

    fn interpret(&self, response: &RawResponse) -> CheckOutcome {
        if let Some(outcome) = retryable_status(response.status) {
            return outcome;
        }
        if !response.is_success() {
            return CheckOutcome::hard(
                FailureKind::NotAnInstance,
                format!(
                    "http {} on {}",
                    response.status.unwrap_or_default(),
                    self.params.path
                ),
            );
        }
        if !self.marker.is_match(&response.body) {
            return CheckOutcome::hard(
                FailureKind::NotAnInstance,
                "response does not look like a searx page",
            );
        }

        let version = GENERATOR_PATTERN
            .captures(&response.body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        CheckOutcome::Success(json!({
            "status": response.status,
            "version": version,
        }))
    }
}

#[async_trait]
impl CheckRunner for Liveness {
    fn kind(&self) -> CheckKind {
        CheckKind::Liveness
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_parts(&[
            CheckKind::Liveness.as_str().as_bytes(),
            Fingerprint::of(&self.params).as_bytes(),
        ])
    }

    async fn run(
        &self,
        instance: &Instance,
        backend: &dyn Transport,
        timeout: Duration,
    ) -> CheckResult {
        let Some(url) = instance.endpoint(&self.params.path) else {
            return CheckResult::new(
                instance,
                self.kind(),
                backend.kind(),
                CheckOutcome::hard(FailureKind::Unrecognized, "health path does not resolve"),
                Duration::ZERO,
            );
        };

        let started = Instant::now();
        let response = backend.execute(&TransportRequest::get(url, timeout)).await;
        let latency = started.elapsed();

        let outcome = match response {
            Ok(response) => self.interpret(&response),
            Err(err) => transport_failure(&err),
        };
        CheckResult::new(instance, self.kind(), backend.kind(), outcome, latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::FailureReason;

    fn liveness() -> Liveness {
        Liveness::new(LivenessParams::default()).unwrap()
    }

    #[test]
    fn test_healthy_page_with_version() {
        let body = r#"<html><head><meta name="generator" content="searxng/2024.5.1"></head>
            <body>SearXNG</body></html>"#;
        let outcome = liveness().interpret(&RawResponse::http(200, body));
        let payload = outcome.payload().unwrap();
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["version"], "2024.5.1");
    }

    #[test]
    fn test_generator_tag_variants() {
        let version = |body: &str| {
            GENERATOR_PATTERN
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };
        assert_eq!(
            version("<META NAME='generator' CONTENT='searx/1.0.0'>").as_deref(),
            Some("1.0.0")
        );
        assert_eq!(
            version(r#"<meta name="generator" content="searxng/2024.5.1+abc123">"#).as_deref(),
            Some("2024.5.1+abc123")
        );
        assert_eq!(version(r#"<meta name="generator" content="WordPress 6.4">"#), None);
    }

    #[test]
    fn test_healthy_page_without_version() {
        let outcome = liveness().interpret(&RawResponse::http(200, "<title>searx</title>"));
        assert!(outcome.is_success());
        assert!(outcome.payload().unwrap()["version"].is_null());
    }

    #[test]
    fn test_server_error_is_soft() {
        let outcome = liveness().interpret(&RawResponse::http(503, ""));
        assert!(matches!(
            outcome,
            CheckOutcome::SoftFailure(FailureReason {
                kind: FailureKind::ServerError,
                ..
            })
        ));
    }

    #[test]
    fn test_parked_domain_is_hard() {
        let outcome = liveness().interpret(&RawResponse::http(200, "<html>buy this domain</html>"));
        assert!(matches!(
            outcome,
            CheckOutcome::HardFailure(FailureReason {
                kind: FailureKind::NotAnInstance,
                ..
            })
        ));
    }

    #[test]
    fn test_not_found_is_hard() {
        let outcome = liveness().interpret(&RawResponse::http(404, "searx"));
        assert!(outcome.is_hard());
    }

    #[test]
    fn test_invalid_marker_is_config_error() {
        let params = LivenessParams {
            marker: "(unclosed".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Liveness::new(params),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_fingerprint_depends_on_params() {
        let a = liveness().fingerprint();
        let b = Liveness::new(LivenessParams {
            path: "/healthz".to_string(),
            ..Default::default()
        })
        .unwrap()
        .fingerprint();
        assert_ne!(a, b);
    }
}
