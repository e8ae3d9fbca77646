//! searxstats core library
//!
//! Probes a fleet of searx / SearXNG instances over direct HTTP, Tor and a
//! headless browser, and folds the per-check results into a [`Snapshot`].

pub mod cache;
pub mod check;
pub mod config;
pub mod error;
pub mod fakes;
pub mod fingerprint;
pub mod health;
pub mod instance;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod transport;

pub use cache::{
    open_store, CacheEntry, CacheError, CacheKey, CacheStore, FsCacheStore, MemoryCacheStore,
    ResultCache,
};
pub use check::{
    build_runners, CheckKind, CheckOutcome, CheckResult, CheckRunner, FailureKind, FailureReason,
};
pub use config::ProbeConfig;
pub use error::{ConfigError, ConfigResult, ProbeError, Result};
pub use fingerprint::Fingerprint;
pub use health::{HealthReport, HealthStatus, InstanceHealth};
pub use instance::{Instance, InstanceId, NetworkType};
pub use registry::InstanceRegistry;
pub use scheduler::{BackendPolicy, ProbeScheduler, RetryPolicy};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use telemetry::init_tracing;
pub use transport::{
    BackendKind, BackendSet, RawResponse, Transport, TransportError, TransportRequest,
};

/// Crate version, as reported in the user agent and CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
