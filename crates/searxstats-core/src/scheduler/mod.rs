//! Probe scheduler: bounded worker pool over (instance, check kind) tasks.
//!
//! Task lifecycle:
//!
//! ```text
//! Pending -> CacheLookup -> hit:  Done
//!                        -> miss: InFlight -> Success / HardFailure -> Done
//!                                          -> SoftFailure -> Retrying -> Pending
//!                                                         -> retries exhausted -> Done
//! ```
//!
//! The dispatch loop owns the queue. It starts an attempt only when fewer
//! than `concurrency` attempts are in flight and no other attempt for the
//! same instance is running. Each attempt runs on its own `JoinSet` task and
//! hands the task back for re-queueing when a retry is due.

pub mod policy;
pub mod retry;
pub mod task;

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{error, warn, Instrument};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::check::{
    build_runners, transport_failure, CheckKind, CheckOutcome, CheckResult, CheckRunner,
    FailureKind,
};
use crate::config::{ProbeConfig, SchedulerConfig};
use crate::error::ConfigResult;
use crate::instance::{Instance, InstanceId};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::InstanceRegistry;
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::transport::{bounded, BackendSet, TransportError};

pub use policy::BackendPolicy;
pub use retry::{RetryDecision, RetryPolicy};
pub use task::CheckTask;

/// Shared, read-only state handed to every worker.
struct WorkerContext {
    backends: BackendSet,
    cache: Arc<ResultCache>,
    policy: BackendPolicy,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    allow_direct: bool,
}

/// What a single attempt produced.
enum Step {
    Done(CheckResult),
    Retry(CheckTask, Duration),
    Crashed(String),
}

struct Attempted {
    instance_id: InstanceId,
    kind: CheckKind,
    attempt: u32,
    step: Step,
}

pub struct ProbeScheduler {
    runners: Vec<Arc<dyn CheckRunner>>,
    backends: BackendSet,
    cache: Arc<ResultCache>,
    policy: BackendPolicy,
    retry: RetryPolicy,
    allow_direct: bool,
    concurrency: usize,
    attempt_timeout: Duration,
    run_deadline: Option<Duration>,
}

impl ProbeScheduler {
    pub fn new(
        runners: Vec<Arc<dyn CheckRunner>>,
        backends: BackendSet,
        cache: Arc<ResultCache>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            runners,
            backends,
            cache,
            policy: BackendPolicy::default(),
            retry: config.retry.clone(),
            allow_direct: true,
            concurrency: config.concurrency.max(1),
            attempt_timeout: config.attempt_timeout(),
            run_deadline: config.run_deadline(),
        }
    }

    /// Scheduler for a full configuration: runners from `config.checks`,
    /// backend preferences from `config.backends`.
    pub fn from_config(
        config: &ProbeConfig,
        backends: BackendSet,
        cache: Arc<ResultCache>,
    ) -> ConfigResult<Self> {
        let runners = build_runners(&config.checks, &config.backends.captcha_pattern)?;
        let scheduler = Self::new(runners, backends, cache, &config.scheduler);
        Ok(scheduler.with_backend_policy(
            config.backends.preferences.clone(),
            config.backends.allow_direct,
        ))
    }

    pub fn with_backend_policy(mut self, policy: BackendPolicy, allow_direct: bool) -> Self {
        self.policy = policy;
        self.allow_direct = allow_direct;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.run_deadline = deadline;
        self
    }

    /// Probe every instance in `registry` with every runner.
    ///
    /// Always returns a snapshot holding exactly one result per scheduled
    /// (instance, check kind) pair, even when the deadline cuts the run short.
    pub async fn run(&self, registry: &InstanceRegistry) -> Snapshot {
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string());
        self.run_instances(run_id, registry.list_instances())
            .instrument(span)
            .await
    }

    async fn run_instances(&self, run_id: Uuid, instances: &[Instance]) -> Snapshot {
        let started = Instant::now();
        let deadline = self.run_deadline.map(|limit| started + limit);
        let run_label = run_id.to_string();
        let builder = SnapshotBuilder::new(run_id);
        let ctx = Arc::new(WorkerContext {
            backends: self.backends.clone(),
            cache: Arc::clone(&self.cache),
            policy: self.policy.clone(),
            retry: self.retry.clone(),
            attempt_timeout: self.attempt_timeout,
            allow_direct: self.allow_direct,
        });

        let mut state = RunState::new(instances, &self.runners, started);
        obs::emit_run_started(&run_label, instances.len(), state.queue.len());

        let mut workers: JoinSet<Attempted> = JoinSet::new();
        let mut deadline_hit = false;
        loop {
            let now = Instant::now();
            while workers.len() < self.concurrency {
                let Some(task) = state.take_ready(now) else {
                    break;
                };
                workers.spawn(supervise(Arc::clone(&ctx), task).in_current_span());
            }
            if workers.is_empty() && state.queue.is_empty() {
                break;
            }

            let wake = if workers.len() < self.concurrency {
                state.next_wake()
            } else {
                None
            };
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    deadline_hit = true;
                    break;
                }
                Some(joined) = workers.join_next() => state.settle(joined, &builder),
                _ = sleep_until(wake) => {}
            }
        }

        if deadline_hit {
            obs::emit_run_deadline_exceeded(&run_label, workers.len(), state.queue.len());
            workers.abort_all();
            while let Some(joined) = workers.join_next().await {
                state.settle(joined, &builder);
            }
            state.expire(&builder);
        }

        let snapshot = builder.finish(deadline_hit);
        obs::emit_run_finished(
            &run_label,
            started.elapsed().as_millis() as u64,
            snapshot.len(),
            deadline_hit,
        );
        METRICS.flush();
        snapshot
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Dispatcher-side bookkeeping.
struct RunState {
    queue: VecDeque<CheckTask>,
    busy: HashSet<InstanceId>,
    /// In-flight pairs and the attempt number they are on.
    in_flight: HashMap<(InstanceId, CheckKind), u32>,
}

impl RunState {
    fn new(instances: &[Instance], runners: &[Arc<dyn CheckRunner>], now: Instant) -> Self {
        let mut queue = VecDeque::with_capacity(instances.len() * runners.len());
        for instance in instances {
            let instance = Arc::new(instance.clone());
            for runner in runners {
                queue.push_back(CheckTask::new(
                    Arc::clone(&instance),
                    Arc::clone(runner),
                    now,
                ));
            }
        }
        Self {
            queue,
            busy: HashSet::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Remove the first task that is due and whose instance is idle.
    fn take_ready(&mut self, now: Instant) -> Option<CheckTask> {
        let position = self
            .queue
            .iter()
            .position(|task| task.is_ready(now) && !self.busy.contains(task.instance_id()))?;
        let task = self.queue.remove(position)?;
        self.busy.insert(task.instance_id().clone());
        self.in_flight
            .insert((task.instance_id().clone(), task.kind()), task.attempt + 1);
        Some(task)
    }

    /// When the earliest waiting task on an idle instance becomes due.
    fn next_wake(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|task| !self.busy.contains(task.instance_id()))
            .map(|task| task.scheduled_at)
            .min()
    }

    fn settle(&mut self, joined: Result<Attempted, JoinError>, builder: &SnapshotBuilder) {
        let attempted = match joined {
            Ok(attempted) => attempted,
            // Aborted attempts are still listed in `in_flight`; `expire` records them.
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!(error = %e, "probe worker failed to join");
                return;
            }
        };

        self.busy.remove(&attempted.instance_id);
        self.in_flight
            .remove(&(attempted.instance_id.clone(), attempted.kind));

        match attempted.step {
            Step::Done(result) => {
                obs::emit_task_finished(
                    &result.instance_id,
                    result.kind,
                    result.backend,
                    &result.outcome,
                    result.attempts,
                    result.cached,
                );
                builder.record(result);
            }
            Step::Retry(mut task, delay) => {
                METRICS.inc_retries();
                obs::emit_task_retrying(
                    task.instance_id(),
                    task.kind(),
                    task.attempt,
                    delay.as_millis() as u64,
                    task.rotations > 0,
                );
                task.scheduled_at = Instant::now() + delay;
                self.queue.push_back(task);
            }
            Step::Crashed(message) => {
                let mut result = CheckResult::unattempted(
                    attempted.instance_id,
                    attempted.kind,
                    CheckOutcome::hard(FailureKind::WorkerCrashed, message),
                );
                result.attempts = attempted.attempt;
                obs::emit_task_finished(
                    &result.instance_id,
                    result.kind,
                    None,
                    &result.outcome,
                    result.attempts,
                    false,
                );
                builder.record(result);
            }
        }
    }

    /// Record results for everything the deadline cut off.
    fn expire(&mut self, builder: &SnapshotBuilder) {
        for ((instance_id, kind), attempt) in self.in_flight.drain() {
            let mut result = CheckResult::unattempted(
                instance_id,
                kind,
                CheckOutcome::soft(
                    FailureKind::DeadlineExceeded,
                    format!("run deadline reached during attempt {attempt}"),
                ),
            );
            result.attempts = attempt;
            builder.record(result);
        }
        for task in self.queue.drain(..) {
            let result = match task.last_result {
                Some(mut last) => {
                    if let CheckOutcome::SoftFailure(reason) | CheckOutcome::HardFailure(reason) =
                        &mut last.outcome
                    {
                        reason.message.push_str(&format!(
                            " (run deadline reached before attempt {})",
                            task.attempt + 1
                        ));
                    }
                    last
                }
                None => CheckResult::unattempted(
                    task.instance.id.clone(),
                    task.runner.kind(),
                    CheckOutcome::soft(
                        FailureKind::DeadlineExceeded,
                        "run deadline reached before the check started",
                    ),
                ),
            };
            builder.record(result);
        }
        self.busy.clear();
    }
}

async fn supervise(ctx: Arc<WorkerContext>, task: CheckTask) -> Attempted {
    let instance_id = task.instance_id().clone();
    let kind = task.kind();
    let attempt = task.attempt + 1;
    let step = match AssertUnwindSafe(attempt_once(&ctx, task))
        .catch_unwind()
        .await
    {
        Ok(step) => step,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                instance = %instance_id,
                kind = %kind,
                panic = %message,
                "probe worker panicked"
            );
            Step::Crashed(message)
        }
    };
    Attempted {
        instance_id,
        kind,
        attempt,
        step,
    }
}

async fn attempt_once(ctx: &WorkerContext, mut task: CheckTask) -> Step {
    let _key_guard = ctx.cache.lock(&task.key).await;
    match ctx.cache.lookup(&task.key) {
        Ok(Some(hit)) => {
            METRICS.inc_cache_hits();
            return Step::Done(hit);
        }
        Ok(None) => {}
        Err(e) => warn!(
            instance = %task.instance_id(),
            kind = %task.kind(),
            error = %e,
            "cache lookup failed, probing anyway"
        ),
    }

    let kind = task.kind();
    let Some(backend) = ctx
        .policy
        .select(kind, &task.instance, &ctx.backends, ctx.allow_direct)
    else {
        let mut result = CheckResult::unattempted(
            task.instance_id().clone(),
            kind,
            CheckOutcome::hard(
                FailureKind::NoBackend,
                format!(
                    "no eligible backend among {:?} for {:?} instance",
                    ctx.policy.preferences(kind),
                    task.instance.network
                ),
            ),
        );
        result.attempts = task.attempt;
        return Step::Done(result);
    };

    task.attempt += 1;
    METRICS.inc_attempts_dispatched();
    METRICS.inc_backend_calls();
    obs::emit_task_dispatched(task.instance_id(), kind, task.attempt);

    let started = Instant::now();
    let run = async {
        Ok::<_, TransportError>(
            task.runner
                .run(&task.instance, backend.as_ref(), ctx.attempt_timeout)
                .await,
        )
    };
    let mut result = match bounded(ctx.attempt_timeout, run).await {
        Ok(result) => result,
        Err(err) => CheckResult::new(
            &task.instance,
            kind,
            backend.kind(),
            transport_failure(&err),
            started.elapsed(),
        ),
    };
    result.attempts = task.attempt;

    match ctx
        .retry
        .decide(result.outcome.clone(), task.attempt, task.rotations)
    {
        RetryDecision::Finish(outcome) => {
            result.outcome = outcome;
            if let Err(e) = ctx.cache.record(&task.key, &result) {
                warn!(
                    instance = %task.instance_id(),
                    kind = %kind,
                    error = %e,
                    "cache write failed"
                );
            }
            Step::Done(result)
        }
        RetryDecision::Retry { delay, rotate } => {
            if rotate {
                if let Err(e) = backend.rotate_circuit().await {
                    warn!(backend = %backend.kind(), error = %e, "circuit rotation failed");
                }
                task.rotations += 1;
                METRICS.inc_circuit_rotations();
            }
            task.last_result = Some(result);
            Step::Retry(task, delay)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
