//! Structured lifecycle events for probe runs.
//!
//! - `run_span` tags everything logged during a run with its `run_id`
//! - `emit_*` functions log one event per lifecycle step
//!
//! Filter with `RUST_LOG`, e.g. `RUST_LOG=searxstats_core=debug`.

use tracing::{debug, info, warn};

use crate::check::{CheckKind, CheckOutcome};
use crate::instance::InstanceId;
use crate::transport::BackendKind;

/// Span for one run; attach with `Instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("searxstats.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, instances: usize, tasks: usize) {
    info!(event = "run.started", run_id = %run_id, instances, tasks);
}

pub fn emit_task_dispatched(instance: &InstanceId, kind: CheckKind, attempt: u32) {
    debug!(event = "task.dispatched", instance = %instance, kind = %kind, attempt);
}

pub fn emit_task_retrying(
    instance: &InstanceId,
    kind: CheckKind,
    attempt: u32,
    delay_ms: u64,
    rotated: bool,
) {
    info!(
        event = "task.retrying",
        instance = %instance,
        kind = %kind,
        attempt,
        delay_ms,
        rotated,
    );
}

pub fn emit_task_finished(
    instance: &InstanceId,
    kind: CheckKind,
    backend: Option<BackendKind>,
    outcome: &CheckOutcome,
    attempts: u32,
    cached: bool,
) {
    let status = match outcome {
        CheckOutcome::Success(_) => "success",
        CheckOutcome::SoftFailure(_) => "soft_failure",
        CheckOutcome::HardFailure(_) => "hard_failure",
    };
    let reason = outcome.failure().map(|r| r.to_string()).unwrap_or_default();
    info!(
        event = "task.finished",
        instance = %instance,
        kind = %kind,
        backend = backend.map(|b| b.as_str()).unwrap_or("none"),
        status,
        reason = %reason,
        attempts,
        cached,
    );
}

pub fn emit_run_deadline_exceeded(run_id: &str, in_flight: usize, queued: usize) {
    warn!(
        event = "run.deadline_exceeded",
        run_id = %run_id,
        in_flight,
        queued,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, results: usize, deadline_hit: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms,
        results,
        deadline_hit,
    );
}
