//! Health classification derived from a [`Snapshot`].
//!
//! An instance is healthy when every check succeeded, degraded when some
//! check soft-failed but none hard-failed, and dead on any hard failure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::check::{CheckKind, CheckOutcome, CheckResult, FailureReason};
use crate::instance::InstanceId;
use crate::registry::InstanceRegistry;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Dead,
}

/// A non-successful check, for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub kind: CheckKind,
    pub hard: bool,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub instance_id: InstanceId,
    pub status: HealthStatus,
    pub version: Option<String>,
    /// Engines reported by the capability check, sorted.
    pub engines: Vec<String>,
    /// Search categories reported by the capability check.
    pub categories: Vec<String>,
    /// Latency of the liveness check.
    pub latency_ms: Option<u64>,
    pub failures: Vec<CheckFailure>,
    /// This run's finish time when healthy, otherwise the previously known value.
    pub last_known_good: Option<DateTime<Utc>>,
}

/// Fleet health for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub deadline_hit: bool,
    pub instances: Vec<InstanceHealth>,
    /// Number of healthy instances offering each engine.
    pub engine_coverage: BTreeMap<String, usize>,
    /// Number of healthy instances offering each search category.
    pub category_coverage: BTreeMap<String, usize>,
    /// `true` only when every instance is healthy.
    pub all_healthy: bool,
    pub unhealthy_instances: Vec<InstanceId>,
}

/// Classify one instance from its check results.
pub fn classify<'a, I>(results: I) -> HealthStatus
where
    I: IntoIterator<Item = &'a CheckResult>,
{
    let mut status = HealthStatus::Healthy;
    for result in results {
        match result.outcome {
            CheckOutcome::HardFailure(_) => return HealthStatus::Dead,
            CheckOutcome::SoftFailure(_) => status = HealthStatus::Degraded,
            CheckOutcome::Success(_) => {}
        }
    }
    status
}

/// String entries of the array at `key`, or empty.
fn string_list(payload: Option<&Value>, key: &str) -> Vec<String> {
    payload
        .and_then(|p| p.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn coverage<'a, I>(lists: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a Vec<String>>,
{
    let mut counts = BTreeMap::new();
    for name in lists.into_iter().flatten() {
        *counts.entry(name.clone()).or_insert(0) += 1;
    }
    counts
}

impl HealthReport {
    /// Build the report. `registry` supplies previously known
    /// last-known-good times; instances missing from it are still reported.
    pub fn from_snapshot(snapshot: &Snapshot, registry: &InstanceRegistry) -> Self {
        let mut instances = Vec::with_capacity(snapshot.results.len());
        for (instance_id, by_kind) in &snapshot.results {
            let status = classify(by_kind.values());
            let payload =
                move |kind: CheckKind| by_kind.get(&kind).and_then(|r| r.outcome.payload());

            let version = [CheckKind::Liveness, CheckKind::CapabilityProbe]
                .into_iter()
                .filter_map(|kind| payload(kind)?.get("version")?.as_str())
                .next()
                .map(str::to_string);
            let capability = payload(CheckKind::CapabilityProbe);
            let engines = string_list(capability, "engines");
            let categories = string_list(capability, "categories");
            let failures = by_kind
                .values()
                .filter_map(|result| {
                    result.outcome.failure().map(|reason| CheckFailure {
                        kind: result.kind,
                        hard: result.outcome.is_hard(),
                        reason: reason.clone(),
                    })
                })
                .collect();
            let last_known_good = match status {
                HealthStatus::Healthy => Some(snapshot.finished_at),
                _ => registry
                    .get(instance_id)
                    .and_then(|instance| instance.last_known_good),
            };

            instances.push(InstanceHealth {
                instance_id: instance_id.clone(),
                status,
                version,
                engines,
                categories,
                latency_ms: by_kind.get(&CheckKind::Liveness).map(|r| r.latency_ms),
                failures,
                last_known_good,
            });
        }

        let healthy: Vec<&InstanceHealth> = instances
            .iter()
            .filter(|h| h.status == HealthStatus::Healthy)
            .collect();
        let engine_coverage = coverage(healthy.iter().map(|h| &h.engines));
        let category_coverage = coverage(healthy.iter().map(|h| &h.categories));

        let all_healthy = instances.iter().all(|h| h.status == HealthStatus::Healthy);
        let unhealthy_instances = instances
            .iter()
            .filter(|h| h.status != HealthStatus::Healthy)
            .map(|h| h.instance_id.clone())
            .collect();

        Self {
            run_id: snapshot.run_id,
            generated_at: Utc::now(),
            deadline_hit: snapshot.deadline_hit,
            instances,
            engine_coverage,
            category_coverage,
            all_healthy,
            unhealthy_instances,
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.count(HealthStatus::Healthy)
    }

    pub fn degraded_count(&self) -> usize {
        self.count(HealthStatus::Degraded)
    }

    pub fn dead_count(&self) -> usize {
        self.count(HealthStatus::Dead)
    }

    fn count(&self, status: HealthStatus) -> usize {
        self.instances.iter().filter(|h| h.status == status).count()
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<&InstanceHealth> {
        self.instances.iter().find(|h| &h.instance_id == instance_id)
    }
}
