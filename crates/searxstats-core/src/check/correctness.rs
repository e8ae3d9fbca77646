//! Correctness probe: does a real query return real results?

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::{
    retryable_status, transport_failure, CheckKind, CheckOutcome, CheckResult, CheckRunner,
    FailureKind,
};
use crate::error::{ConfigError, ConfigResult};
use crate::fingerprint::Fingerprint;
use crate::instance::Instance;
use crate::transport::{BackendKind, RawResponse, Transport, TransportRequest};

/// Counts result blocks on the rendered page.
const DEFAULT_COUNT_SCRIPT: &str =
    "return document.querySelectorAll('#urls .result, #main_results .result').length;";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectnessParams {
    pub path: String,
    pub query: String,
    /// Ask for `format=json`. Many instances disable it, so HTML is the default.
    pub format_json: bool,
    pub min_results: usize,
    /// Regex matching one result block in the HTML page.
    pub result_marker: String,
    /// Evaluated by the browser backend; must return the result count.
    pub count_script: String,
}

impl Default for CorrectnessParams {
    fn default() -> Self {
        Self {
            path: "search".to_string(),
            query: "time".to_string(),
            format_json: false,
            min_results: 1,
            result_marker: r#"(?i)class="result[\s"]"#.to_string(),
            count_script: DEFAULT_COUNT_SCRIPT.to_string(),
        }
    }
}

pub struct CorrectnessProbe {
    params: CorrectnessParams,
    result_marker: Regex,
    captcha: Regex,
}

impl CorrectnessProbe {
    pub fn new(params: CorrectnessParams, captcha: &str) -> ConfigResult<Self> {
        let result_marker =
            Regex::new(&params.result_marker).map_err(|source| ConfigError::InvalidRegex {
                field: "checks.correctness.result_marker".to_string(),
                source,
            })?;
        let captcha = Regex::new(captcha).map_err(|source| ConfigError::InvalidRegex {
            field: "backends.captcha_pattern".to_string(),
            source,
        })?;
        Ok(Self {
            params,
            result_marker,
            captcha,
        })
    }

    fn request(
        &self,
        instance: &Instance,
        backend: BackendKind,
        timeout: Duration,
    ) -> Option<TransportRequest> {
        let mut url = instance.endpoint(&self.params.path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("q", &self.params.query);
            if self.params.format_json {
                query.append_pair("format", "json");
            }
        }
        let mut request = TransportRequest::get(url, timeout);
        if backend == BackendKind::Browser {
            request = request.with_script(self.params.count_script.clone());
        }
        Some(request)
    }

    fn interpret(&self, response: &RawResponse) -> CheckOutcome {
        if let Some(outcome) = retryable_status(response.status) {
            return outcome;
        }
        if !response.is_success() {
            return CheckOutcome::soft(
                FailureKind::Blocked,
                format!("search refused with http {}", response.status.unwrap_or_default()),
            );
        }
        if let Some(m) = self.captcha.find(&response.body) {
            return CheckOutcome::soft(
                FailureKind::Blocked,
                format!("captcha marker {:?}", m.as_str()),
            );
        }

        let count = match self.count_results(response) {
            Ok(count) => count,
            Err(outcome) => return outcome,
        };
        if count < self.params.min_results {
            return CheckOutcome::soft(
                FailureKind::EmptyResults,
                format!(
                    "{count} results for {:?}, expected at least {}",
                    self.params.query, self.params.min_results
                ),
            );
        }
        CheckOutcome::Success(json!({
            "results": count,
            "query": self.params.query,
        }))
    }

    fn count_results(&self, response: &RawResponse) -> Result<usize, CheckOutcome> {
        if let Some(count) = response.script_value.as_ref().and_then(Value::as_u64) {
            return Ok(count as usize);
        }

        let body = response.body.trim_start();
        let is_json = response
            .header("content-type")
            .is_some_and(|ct| ct.contains("json"))
            || body.starts_with('{');
        if is_json {
            let document: Value = serde_json::from_str(body).map_err(|e| {
                CheckOutcome::hard(FailureKind::Corrupt, format!("result json: {e}"))
            })?;
            return match document.get("results").and_then(Value::as_array) {
                Some(results) => Ok(results.len()),
                None => Err(CheckOutcome::hard(
                    FailureKind::Corrupt,
                    "result json has no results array",
                )),
            };
        }

        if body.starts_with('<') {
            return Ok(self.result_marker.find_iter(body).count());
        }
        Err(CheckOutcome::hard(
            FailureKind::Corrupt,
            "result page is neither html nor json",
        ))
    }
}

#[async_trait]
impl CheckRunner for CorrectnessProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::CorrectnessProbe
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_parts(&[
            CheckKind::CorrectnessProbe.as_str().as_bytes(),
            Fingerprint::of(&self.params).as_bytes(),
            self.captcha.as_str().as_bytes(),
        ])
    }

    async fn run(
        &self,
        instance: &Instance,
        backend: &dyn Transport,
        timeout: Duration,
    ) -> CheckResult {
        let Some(request) = self.request(instance, backend.kind(), timeout) else {
            return CheckResult::new(
                instance,
                self.kind(),
                backend.kind(),
                CheckOutcome::hard(FailureKind::Unrecognized, "search path does not resolve"),
                Duration::ZERO,
            );
        };

        let started = Instant::now();
        let response = backend.execute(&request).await;
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
    use crate::transport::DEFAULT_CAPTCHA_PATTERN;

    fn probe() -> CorrectnessProbe {
        CorrectnessProbe::new(CorrectnessParams::default(), DEFAULT_CAPTCHA_PATTERN).unwrap()
    }

    fn failure_kind(outcome: &CheckOutcome) -> Option<FailureKind> {
        outcome.failure().map(|reason| reason.kind)
    }

    #[test]
    fn test_request_carries_query() {
        let instance = Instance::parse("https://searx.example/sub/").unwrap();
        let request = probe()
            .request(&instance, BackendKind::Direct, Duration::from_secs(5))
            .unwrap();
        assert_eq!(request.url.as_str(), "https://searx.example/sub/search?q=time");
        assert!(request.script.is_none());

        let browser = probe()
            .request(&instance, BackendKind::Browser, Duration::from_secs(5))
            .unwrap();
        assert!(browser.script.is_some());
    }

    #[test]
    fn test_html_results_counted() {
        let body = r#"<html><div id="urls">
            <article class="result result-default">a</article>
            <article class="result">b</article>
            </div></html>"#;
        let outcome = probe().interpret(&RawResponse::http(200, body));
        assert_eq!(outcome.payload().unwrap()["results"], 2);
    }

    #[test]
    fn test_json_results_counted() {
        let body = r#"{"query": "time", "results": [{"url": "a"}, {"url": "b"}, {"url": "c"}]}"#;
        let outcome = probe().interpret(&RawResponse::http(200, body));
        assert_eq!(outcome.payload().unwrap()["results"], 3);
    }

    #[test]
    fn test_script_value_wins() {
        let response = RawResponse {
            body: "<html>rendered</html>".to_string(),
            script_value: Some(json!(12)),
            ..Default::default()
        };
        let outcome = probe().interpret(&response);
        assert_eq!(outcome.payload().unwrap()["results"], 12);
    }

    #[test]
    fn test_empty_results_are_soft() {
        let outcome = probe().interpret(&RawResponse::http(200, "<html>no results</html>"));
        assert!(matches!(
            outcome,
            CheckOutcome::SoftFailure(FailureReason {
                kind: FailureKind::EmptyResults,
                ..
            })
        ));
    }

    #[test]
    fn test_corrupt_json_is_hard() {
        let outcome = probe().interpret(&RawResponse::http(200, r#"{"results": 4"#));
        assert!(outcome.is_hard());
        assert_eq!(failure_kind(&outcome), Some(FailureKind::Corrupt));

        let outcome = probe().interpret(&RawResponse::http(200, r#"{"results": "none"}"#));
        assert_eq!(failure_kind(&outcome), Some(FailureKind::Corrupt));
    }

    #[test]
    fn test_garbage_body_is_corrupt() {
        let outcome = probe().interpret(&RawResponse::http(200, "\u{0}\u{1}binary"));
        assert_eq!(failure_kind(&outcome), Some(FailureKind::Corrupt));
    }

    #[test]
    fn test_captcha_and_forbidden_are_blocked() {
        let outcome = probe().interpret(&RawResponse::http(200, "<div class=g-recaptcha>"));
        assert_eq!(failure_kind(&outcome), Some(FailureKind::Blocked));
        assert!(!outcome.is_hard());

        let outcome = probe().interpret(&RawResponse::http(403, "forbidden"));
        assert_eq!(failure_kind(&outcome), Some(FailureKind::Blocked));
    }
}
