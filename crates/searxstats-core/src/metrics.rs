//! Global atomic counters for probe runs.
//!
//! Counters are bumped silently at the call site. [`Metrics::flush`] emits
//! the current values as one `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    attempts_dispatched: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    circuit_rotations: AtomicU64,
    backend_calls: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            attempts_dispatched: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            circuit_rotations: AtomicU64::new(0),
            backend_calls: AtomicU64::new(0),
        }
    }

    pub fn inc_attempts_dispatched(&self) {
        self.attempts_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_rotations(&self) {
        self.circuit_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_calls(&self) {
        self.backend_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            attempts_dispatched = self.attempts_dispatched(),
            cache_hits = self.cache_hits(),
            retries = self.retries(),
            circuit_rotations = self.circuit_rotations(),
            backend_calls = self.backend_calls(),
        );
    }

    pub fn attempts_dispatched(&self) -> u64 {
        self.attempts_dispatched.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn circuit_rotations(&self) -> u64 {
        self.circuit_rotations.load(Ordering::Relaxed)
    }

    pub fn backend_calls(&self) -> u64 {
        self.backend_calls.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.attempts_dispatched.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.circuit_rotations.store(0, Ordering::Relaxed);
        self.backend_calls.store(0, Ordering::Relaxed);
    }
}
