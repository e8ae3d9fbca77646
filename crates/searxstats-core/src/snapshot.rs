//! Run snapshot: one result per (instance, check kind).

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::check::{CheckKind, CheckResult};
use crate::instance::InstanceId;

/// Finalized results of a probe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether the run deadline cut the run short.
    pub deadline_hit: bool,
    pub results: BTreeMap<InstanceId, BTreeMap<CheckKind, CheckResult>>,
}

impl Snapshot {
    pub fn get(&self, instance: &InstanceId, kind: CheckKind) -> Option<&CheckResult> {
        self.results.get(instance)?.get(&kind)
    }

    /// All results, ordered by instance then kind.
    pub fn iter(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.values().flat_map(|by_kind| by_kind.values())
    }

    /// Total number of results.
    pub fn len(&self) -> usize {
        self.results.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accumulates results while a run is in progress. Safe to share.
pub struct SnapshotBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    results: Mutex<BTreeMap<InstanceId, BTreeMap<CheckKind, CheckResult>>>,
}

impl SnapshotBuilder {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a terminal result. The first result for a pair wins; later ones
    /// are dropped and `false` is returned.
    pub fn record(&self, result: CheckResult) -> bool {
        let mut results = self.results.lock().unwrap_or_else(|p| p.into_inner());
        let by_kind = results.entry(result.instance_id.clone()).or_default();
        if by_kind.contains_key(&result.kind) {
            warn!(
                instance = %result.instance_id,
                kind = %result.kind,
                "duplicate result ignored"
            );
            return false;
        }
        by_kind.insert(result.kind, result);
        true
    }

    /// Hand off the accumulated results as an immutable snapshot.
    pub fn finish(&self, deadline_hit: bool) -> Snapshot {
        let mut guard = self.results.lock().unwrap_or_else(|p| p.into_inner());
        let results = std::mem::take(&mut *guard);
        drop(guard);
        Snapshot {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            deadline_hit,
            results,
        }
    }
}
