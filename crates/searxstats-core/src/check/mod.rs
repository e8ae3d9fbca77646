//! Check runners and their verdict types.
//!
//! A runner performs exactly one backend call and turns the raw response into
//! a [`CheckResult`]. Runners never retry and keep no state between calls;
//! retries belong to the scheduler.

pub mod capability;
pub mod correctness;
pub mod liveness;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ChecksConfig;
use crate::error::ConfigResult;
use crate::fingerprint::Fingerprint;
use crate::instance::{Instance, InstanceId};
use crate::transport::{BackendKind, Transport, TransportError};

pub use capability::{CapabilityParams, CapabilityProbe};
pub use correctness::{CorrectnessParams, CorrectnessProbe};
pub use liveness::{Liveness, LivenessParams};

/// Category of probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    #[serde(rename = "liveness")]
    Liveness,
    #[serde(rename = "capability")]
    CapabilityProbe,
    #[serde(rename = "correctness")]
    CorrectnessProbe,
}

impl CheckKind {
    pub const ALL: [CheckKind; 3] = [
        CheckKind::Liveness,
        CheckKind::CapabilityProbe,
        CheckKind::CorrectnessProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Liveness => "liveness",
            CheckKind::CapabilityProbe => "capability",
            CheckKind::CorrectnessProbe => "correctness",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a check did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    TimedOut,
    Protocol,
    Blocked,
    SessionAcquisition,
    RateLimited,
    ServerError,
    NotAnInstance,
    Unrecognized,
    PartialMetadata,
    EmptyResults,
    Corrupt,
    NoBackend,
    DeadlineExceeded,
    WorkerCrashed,
}

impl FailureKind {
    /// Soft failures of these kinds become hard once retries run out: the
    /// instance never answered at all.
    pub fn escalates_on_exhaustion(&self) -> bool {
        matches!(
            self,
            FailureKind::Unreachable | FailureKind::TimedOut | FailureKind::Blocked
        )
    }

    /// Hard verdicts derived from the instance's own response, stable enough
    /// to cache.
    pub fn is_content_verdict(&self) -> bool {
        matches!(
            self,
            FailureKind::NotAnInstance | FailureKind::Unrecognized | FailureKind::Corrupt
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Terminal verdict of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    Success(Value),
    SoftFailure(FailureReason),
    HardFailure(FailureReason),
}

impl CheckOutcome {
    pub fn soft(kind: FailureKind, message: impl Into<String>) -> Self {
        CheckOutcome::SoftFailure(FailureReason::new(kind, message))
    }

    pub fn hard(kind: FailureKind, message: impl Into<String>) -> Self {
        CheckOutcome::HardFailure(FailureReason::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Success(_))
    }

    pub fn is_hard(&self) -> bool {
        matches!(self, CheckOutcome::HardFailure(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            CheckOutcome::Success(_) => None,
            CheckOutcome::SoftFailure(reason) | CheckOutcome::HardFailure(reason) => Some(reason),
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            CheckOutcome::Success(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Result of one (instance, check kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub instance_id: InstanceId,
    pub kind: CheckKind,
    pub outcome: CheckOutcome,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// `None` when no backend was involved (no eligible backend, never dispatched).
    pub backend: Option<BackendKind>,
    pub attempts: u32,
    #[serde(default)]
    pub cached: bool,
}

impl CheckResult {
    pub fn new(
        instance: &Instance,
        kind: CheckKind,
        backend: BackendKind,
        outcome: CheckOutcome,
        latency: Duration,
    ) -> Self {
        Self {
            instance_id: instance.id.clone(),
            kind,
            outcome,
            latency_ms: latency.as_millis() as u64,
            timestamp: Utc::now(),
            backend: Some(backend),
            attempts: 1,
            cached: false,
        }
    }

    /// A result recorded without any backend call.
    pub fn unattempted(instance_id: InstanceId, kind: CheckKind, outcome: CheckOutcome) -> Self {
        Self {
            instance_id,
            kind,
            outcome,
            latency_ms: 0,
            timestamp: Utc::now(),
            backend: None,
            attempts: 0,
            cached: false,
        }
    }

    /// Whether this result may be served from cache in a later attempt or run.
    pub fn is_cacheable(&self) -> bool {
        match &self.outcome {
            CheckOutcome::Success(_) => true,
            CheckOutcome::HardFailure(reason) => reason.kind.is_content_verdict(),
            CheckOutcome::SoftFailure(_) => false,
        }
    }
}

/// Per-kind probe logic.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    fn kind(&self) -> CheckKind;

    /// Identifies the runner's parameters for cache keys.
    fn fingerprint(&self) -> Fingerprint;

    /// Perform one attempt against `instance` through `backend`.
    async fn run(
        &self,
        instance: &Instance,
        backend: &dyn Transport,
        timeout: Duration,
    ) -> CheckResult;
}

/// Soft failure describing a transport error.
pub fn transport_failure(err: &TransportError) -> CheckOutcome {
    let kind = match err {
        TransportError::ConnectFailed(_) => FailureKind::Unreachable,
        TransportError::TimedOut { .. } => FailureKind::TimedOut,
        TransportError::ProtocolError(_) => FailureKind::Protocol,
        TransportError::Blocked(_) => FailureKind::Blocked,
        TransportError::SessionAcquisition(_) => FailureKind::SessionAcquisition,
    };
    CheckOutcome::soft(kind, err.to_string())
}

/// Soft failure for statuses that say "try again later", if `status` is one.
pub(crate) fn retryable_status(status: Option<u16>) -> Option<CheckOutcome> {
    match status? {
        429 => Some(CheckOutcome::soft(
            FailureKind::RateLimited,
            "http 429 too many requests",
        )),
        s if s >= 500 => Some(CheckOutcome::soft(
            FailureKind::ServerError,
            format!("http {s}"),
        )),
        _ => None,
    }
}

/// Build the enabled runners from configuration, in `CheckKind` order.
pub fn build_runners(
    config: &ChecksConfig,
    captcha: &str,
) -> ConfigResult<Vec<Arc<dyn CheckRunner>>> {
    let mut kinds = config.enabled.clone();
    kinds.sort();
    kinds.dedup();

    let mut runners: Vec<Arc<dyn CheckRunner>> = Vec::new();
    for kind in kinds {
        let runner: Arc<dyn CheckRunner> = match kind {
            CheckKind::Liveness => Arc::new(Liveness::new(config.liveness.clone())?),
            CheckKind::CapabilityProbe => Arc::new(CapabilityProbe::new(config.capability.clone())),
            CheckKind::CorrectnessProbe => Arc::new(CorrectnessProbe::new(
                config.correctness.clone(),
                captcha,
            )?),
        };
        runners.push(runner);
    }
    Ok(runners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_mapping() {
        let cases = [
            (
                TransportError::ConnectFailed("refused".into()),
                FailureKind::Unreachable,
            ),
            (
                TransportError::TimedOut { limit_ms: 10 },
                FailureKind::TimedOut,
            ),
            (
                TransportError::ProtocolError("bad frame".into()),
                FailureKind::Protocol,
            ),
            (TransportError::Blocked("429".into()), FailureKind::Blocked),
        ];
        for (err, kind) in cases {
            match transport_failure(&err) {
                CheckOutcome::SoftFailure(reason) => assert_eq!(reason.kind, kind),
                other => panic!("expected soft failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_retryable_status() {
        assert!(retryable_status(Some(200)).is_none());
        assert!(retryable_status(Some(404)).is_none());
        assert!(retryable_status(None).is_none());
        assert!(matches!(
            retryable_status(Some(429)),
            Some(CheckOutcome::SoftFailure(FailureReason {
                kind: FailureKind::RateLimited,
                ..
            }))
        ));
        assert!(matches!(
            retryable_status(Some(502)),
            Some(CheckOutcome::SoftFailure(FailureReason {
                kind: FailureKind::ServerError,
                ..
            }))
        ));
    }

    #[test]
    fn test_cacheable_results() {
        let id = Instance::parse("https://a.example/").unwrap().id;
        let ok = CheckResult::unattempted(
            id.clone(),
            CheckKind::Liveness,
            CheckOutcome::Success(serde_json::json!({})),
        );
        let not_instance = CheckResult::unattempted(
            id.clone(),
            CheckKind::Liveness,
            CheckOutcome::hard(FailureKind::NotAnInstance, "no marker"),
        );
        let dead = CheckResult::unattempted(
            id.clone(),
            CheckKind::Liveness,
            CheckOutcome::hard(FailureKind::Unreachable, "refused"),
        );
        let soft = CheckResult::unattempted(
            id,
            CheckKind::Liveness,
            CheckOutcome::soft(FailureKind::ServerError, "502"),
        );
        assert!(ok.is_cacheable());
        assert!(not_instance.is_cacheable());
        assert!(!dead.is_cacheable());
        assert!(!soft.is_cacheable());
    }

    #[test]
    fn test_result_json_shape() {
        let id = Instance::parse("https://a.example/").unwrap().id;
        let result = CheckResult::unattempted(
            id,
            CheckKind::CorrectnessProbe,
            CheckOutcome::soft(FailureKind::EmptyResults, "0 results"),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "correctness");
        assert_eq!(json["outcome"]["status"], "soft_failure");
        assert_eq!(json["outcome"]["detail"]["kind"], "empty_results");

        let back: CheckResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_build_runners_respects_enabled_set() {
        let mut config = ChecksConfig::default();
        config.enabled = vec![
            CheckKind::CorrectnessProbe,
            CheckKind::Liveness,
            CheckKind::Liveness,
        ];
        let runners = build_runners(&config, crate::transport::DEFAULT_CAPTCHA_PATTERN).unwrap();
        let kinds: Vec<CheckKind> = runners.iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, vec![CheckKind::Liveness, CheckKind::CorrectnessProbe]);
    }
}
