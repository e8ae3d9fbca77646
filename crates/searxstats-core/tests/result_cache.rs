use std::sync::Arc;
use std::time::Duration;

use searxstats_core::cache::{CacheStore, FsCacheStore, MemoryCacheStore};
use searxstats_core::check::{Liveness, LivenessParams};
use searxstats_core::config::SchedulerConfig;
use searxstats_core::fakes::{Reply, ScriptedTransport, HEALTHY_PAGE};
use searxstats_core::{
    BackendKind, BackendSet, CheckRunner, InstanceRegistry, ProbeScheduler, ResultCache,
};

fn liveness() -> Vec<Arc<dyn CheckRunner>> {
    vec![Arc::new(Liveness::new(LivenessParams::default()).unwrap())]
}

fn scheduler(transport: Arc<ScriptedTransport>, cache: Arc<ResultCache>) -> ProbeScheduler {
    ProbeScheduler::new(
        liveness(),
        BackendSet::new().with(transport),
        cache,
        &SchedulerConfig::default(),
    )
}

fn memory_cache(ttl: Duration) -> Arc<ResultCache> {
    Arc::new(ResultCache::new(Arc::new(MemoryCacheStore::default()), ttl))
}

fn registry() -> InstanceRegistry {
    InstanceRegistry::from_urls(["https://a.example/", "https://b.example/"]).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_shared_cache_single_backend_call_per_key() {
    let transport = Arc::new(ScriptedTransport::new(BackendKind::Direct));
    let slow = Reply::ok(HEALTHY_PAGE).after(Duration::from_millis(200));
    transport.script("a.example", [slow.clone()]);
    transport.script("b.example", [slow]);

    let cache = memory_cache(Duration::from_secs(3600));
    let first = scheduler(transport.clone(), Arc::clone(&cache));
    let second = scheduler(transport.clone(), Arc::clone(&cache));
    let registry = registry();

    let (left, right) = tokio::join!(first.run(&registry), second.run(&registry));

    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.calls_for_host("a.example"), 1);
    assert_eq!(transport.calls_for_host("b.example"), 1);
    for instance in registry.list_instances() {
        let results: Vec<_> = [&left, &right]
            .iter()
            .map(|snapshot| {
                snapshot
                    .get(&instance.id, searxstats_core::CheckKind::Liveness)
                    .unwrap()
            })
            .collect();
        assert!(results.iter().all(|r| r.outcome.is_success()));
        assert_eq!(results.iter().filter(|r| r.cached).count(), 1);
        assert_eq!(results[0].outcome, results[1].outcome);
    }
}

#[tokio::test(start_paused = true)]
async fn test_warm_cache_rerun_makes_no_calls() {
    let transport = Arc::new(ScriptedTransport::new(BackendKind::Direct));
    let probe = scheduler(transport.clone(), memory_cache(Duration::from_secs(3600)));
    let registry = registry();

    let cold = probe.run(&registry).await;
    let calls = transport.calls();
    assert_eq!(calls, 2);
    assert!(cold.iter().all(|r| !r.cached));

    let warm = probe.run(&registry).await;
    assert_eq!(transport.calls(), calls);
    assert_eq!(warm.len(), cold.len());
    for result in warm.iter() {
        assert!(result.cached);
        let before = cold.get(&result.instance_id, result.kind).unwrap();
        assert_eq!(result.outcome, before.outcome);
        assert_eq!(result.backend, before.backend);
    }
    assert_ne!(warm.run_id, cold.run_id);
}

#[tokio::test(start_paused = true)]
async fn test_soft_failures_are_not_cached() {
    let transport = Arc::new(
        ScriptedTransport::new(BackendKind::Direct)
            .with_script("a.example", [Reply::status(503, "busy")]),
    );
    let config = SchedulerConfig {
        retry: searxstats_core::RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let probe = ProbeScheduler::new(
        liveness(),
        BackendSet::new().with(transport.clone()),
        memory_cache(Duration::from_secs(3600)),
        &config,
    );
    let registry = InstanceRegistry::from_urls(["https://a.example/"]).unwrap();

    probe.run(&registry).await;
    probe.run(&registry).await;
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_expired_entries_are_probed_again() {
    let transport = Arc::new(ScriptedTransport::new(BackendKind::Direct));
    let probe = scheduler(transport.clone(), memory_cache(Duration::ZERO));
    let registry = registry();

    probe.run(&registry).await;
    let rerun = probe.run(&registry).await;
    assert_eq!(transport.calls(), 4);
    assert!(rerun.iter().all(|r| !r.cached));
}

#[tokio::test]
async fn test_file_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();

    let first_transport = Arc::new(ScriptedTransport::new(BackendKind::Direct));
    let store: Arc<dyn CacheStore> = Arc::new(FsCacheStore::new(dir.path()).unwrap());
    let first = scheduler(
        first_transport.clone(),
        Arc::new(ResultCache::new(store, Duration::from_secs(3600))),
    );
    let cold = first.run(&registry).await;
    assert_eq!(first_transport.calls(), 2);

    // A fresh store over the same directory stands in for a new process.
    let second_transport = Arc::new(ScriptedTransport::new(BackendKind::Direct));
    let store: Arc<dyn CacheStore> = Arc::new(FsCacheStore::new(dir.path()).unwrap());
    let second = scheduler(
        second_transport.clone(),
        Arc::new(ResultCache::new(store, Duration::from_secs(3600))),
    );
    let warm = second.run(&registry).await;

    assert_eq!(second_transport.calls(), 0);
    for result in warm.iter() {
        assert!(result.cached);
        let before = cold.get(&result.instance_id, result.kind).unwrap();
        assert_eq!(result.outcome, before.outcome);
    }
}
