//! Capability probe: which search engines does the instance offer?
//!
//! Reads the instance's `/config` metadata endpoint.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::{
    retryable_status, transport_failure, CheckKind, CheckOutcome, CheckResult, CheckRunner,
    FailureKind,
};
use crate::fingerprint::Fingerprint;
use crate::instance::Instance;
use crate::transport::{RawResponse, Transport, TransportRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityParams {
    pub path: String,
}

impl Default for CapabilityParams {
    fn default() -> Self {
        Self {
            path: "/config".to_string(),
        }
    }
}

pub struct CapabilityProbe {
    params: CapabilityParams,
}

impl CapabilityProbe {
    pub fn new(params: CapabilityParams) -> Self {
        Self { params }
    }

    fn interpret(&self, instance: &Instance, response: &RawResponse) -> CheckOutcome {
        if let Some(outcome) = retryable_status(response.status) {
            return outcome;
        }
        if !response.is_success() {
            return CheckOutcome::hard(
                FailureKind::Unrecognized,
                format!("http {} on {}", response.status.unwrap_or_default(), self.params.path),
            );
        }

        let document: Value = match serde_json::from_str(&response.body) {
            Ok(value) => value,
            Err(e) => {
                return CheckOutcome::hard(
                    FailureKind::Unrecognized,
                    format!("metadata is not json: {e}"),
                )
            }
        };
        let Some(document) = document.as_object() else {
            return CheckOutcome::hard(FailureKind::Unrecognized, "metadata is not a json object");
        };

        let Some(entries) = document.get("engines").and_then(Value::as_array) else {
            return CheckOutcome::soft(FailureKind::PartialMetadata, "metadata has no engine list");
        };

        let mut engines = BTreeSet::new();
        let mut malformed = 0usize;
        for entry in entries {
            match entry.get("name").and_then(Value::as_str) {
                Some(name) => {
                    let enabled = entry.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                    if enabled {
                        engines.insert(name.to_string());
                    }
                }
                None => malformed += 1,
            }
        }
        if malformed > 0 {
            return CheckOutcome::soft(
                FailureKind::PartialMetadata,
                format!(
                    "{malformed} of {} engine entries unreadable, {} parsed",
                    entries.len(),
                    engines.len()
                ),
            );
        }

        let categories: Vec<&str> = document
            .get("categories")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let missing: Vec<&String> = instance
            .capabilities
            .iter()
            .filter(|declared| !engines.contains(*declared))
            .collect();

        CheckOutcome::Success(json!({
            "version": document.get("version"),
            "instance_name": document.get("instance_name"),
            "engines": engines,
            "categories": categories,
            "missing_declared": missing,
        }))
    }
}

#[async_trait]
impl CheckRunner for CapabilityProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::CapabilityProbe
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_parts(&[
            CheckKind::CapabilityProbe.as_str().as_bytes(),
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
                CheckOutcome::hard(FailureKind::Unrecognized, "metadata path does not resolve"),
                Duration::ZERO,
            );
        };
        let request = TransportRequest::get(url, timeout).with_header("accept", "application/json");

        let started = Instant::now();
        let response = backend.execute(&request).await;
        let latency = started.elapsed();

        let outcome = match response {
            Ok(response) => self.interpret(instance, &response),
            Err(err) => transport_failure(&err),
        };
        CheckResult::new(instance, self.kind(), backend.kind(), outcome, latency)
    }
}
