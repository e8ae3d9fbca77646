use std::sync::Arc;

use tokio::time::Instant;

use crate::cache::CacheKey;
use crate::check::{CheckKind, CheckResult, CheckRunner};
use crate::instance::{Instance, InstanceId};

/// One (instance, check kind) pair working its way to a result.
///
/// Owned by the dispatcher while queued and by a worker while in flight.
pub struct CheckTask {
    pub instance: Arc<Instance>,
    pub runner: Arc<dyn CheckRunner>,
    pub key: CacheKey,
    /// Backend attempts made so far.
    pub attempt: u32,
    pub rotations: u32,
    /// Earliest time the next attempt may start.
    pub scheduled_at: Instant,
    /// Result of the latest attempt, kept in case the run ends before
    /// another one completes.
    pub last_result: Option<CheckResult>,
}

impl CheckTask {
    pub fn new(instance: Arc<Instance>, runner: Arc<dyn CheckRunner>, now: Instant) -> Self {
        let key = CacheKey::new(instance.id.clone(), runner.kind(), runner.fingerprint());
        Self {
            instance,
            runner,
            key,
            attempt: 0,
            rotations: 0,
            scheduled_at: now,
            last_result: None,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance.id
    }

    pub fn kind(&self) -> CheckKind {
        self.runner.kind()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.scheduled_at <= now
    }
}

impl std::fmt::Debug for CheckTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckTask")
            .field("instance", &self.instance.id)
            .field("kind", &self.kind())
            .field("attempt", &self.attempt)
            .field("rotations", &self.rotations)
            .finish()
    }
}
