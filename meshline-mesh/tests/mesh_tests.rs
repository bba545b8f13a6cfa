use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::future::join_all;
use meshline_core::{HealthStatus, PartitionStatus, ServiceDescriptor, ServiceInstance};
use meshline_mesh::resilience::{ExponentialBackoff, RetryConfig};
use meshline_mesh::*;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower::ServiceExt;

fn retry_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
        jitter: false,
    }
}

fn client(backend: Arc<InMemoryRegistry>, max_attempts: u32) -> Arc<RegistryClient> {
    let config = RegistryConfig {
        retry: retry_config(max_attempts),
        ..Default::default()
    };
    Arc::new(RegistryClient::new(backend, &config))
}

// ===== Registry Resilience =====

#[tokio::test(start_paused = true)]
async fn test_discover_recovers_within_backoff_bound() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.insert_instance(ServiceInstance::new("billing", "billing-1", "10.0.0.1", 9000));
    backend.script("discover", Fault::Unavailable, 2);
    let client = client(Arc::clone(&backend), 5);

    let started = Instant::now();
    let instances = client.discover("billing").await.unwrap();

    assert_eq!(instances.len(), 1);
    assert_eq!(backend.calls("discover"), 3);

    let bound = ExponentialBackoff::new(retry_config(5)).backoff_bound();
    let elapsed = started.elapsed();
    // Two failures sleep 100ms + 200ms.
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed <= bound, "{elapsed:?} exceeds {bound:?}");
}

#[tokio::test(start_paused = true)]
async fn test_persistent_outage_reports_attempts() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.script("put_kv", Fault::Unavailable, 5);
    let client = client(Arc::clone(&backend), 5);

    let err = client.put_kv("k", "v").await.unwrap_err();
    match err {
        MeshError::RegistryUnavailable {
            operation,
            attempts,
            ..
        } => {
            assert_eq!(operation, "put_kv");
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ===== Discovery =====

#[tokio::test(start_paused = true)]
async fn test_concurrent_resolves_share_one_discover() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.insert_instance(ServiceInstance::new("billing", "billing-1", "10.0.0.1", 9000));
    backend.script("discover", Fault::Delay(Duration::from_millis(200)), 1);

    let cache = DiscoveryCache::new(client(Arc::clone(&backend), 5), &DiscoveryConfig::default());
    let results = join_all((0..16).map(|_| cache.resolve("billing"))).await;

    assert!(results.iter().all(|instances| instances.len() == 1));
    assert_eq!(backend.calls("discover"), 1);

    let stats = cache.statistics();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 15);
}

#[tokio::test(start_paused = true)]
async fn test_resolves_within_ttl_hit_cache() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.insert_instance(ServiceInstance::new("billing", "billing-1", "10.0.0.1", 9000));
    let config = DiscoveryConfig {
        ttl: Duration::from_secs(10),
    };
    let cache = DiscoveryCache::new(client(Arc::clone(&backend), 5), &config);

    for _ in 0..5 {
        cache.resolve("billing").await;
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    assert_eq!(backend.calls("discover"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registration_event_invalidates_cache() {
    let backend = Arc::new(InMemoryRegistry::new());
    let client = client(Arc::clone(&backend), 5);
    let cache = Arc::new(DiscoveryCache::new(Arc::clone(&client), &DiscoveryConfig::default()));
    let listener = Arc::clone(&cache).spawn_invalidation(client.subscribe());

    assert!(cache.resolve("orders").await.is_empty());

    client
        .register(&ServiceDescriptor::new("orders", "orders-1", "10.0.0.4", 8080))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(cache.resolve("orders").await.len(), 1);
    listener.abort();
}

// ===== Health Monitoring =====

#[tokio::test(start_paused = true)]
async fn test_slow_dependency_critical_while_fast_one_passes() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.insert_instance(ServiceInstance::new("fast", "fast-1", "10.0.0.1", 80));
    backend.insert_instance(ServiceInstance::new("slow", "slow-1", "10.0.0.2", 80));
    backend.set_probe_delay("slow-1", Duration::from_secs(30));

    let config = MeshConfig::builder()
        .probe_deadline(Duration::from_secs(1))
        .dependency(DependencyConfig::required("fast"))
        .dependency(DependencyConfig::optional("slow"))
        .build();
    let mesh = MeshIntegrator::new(backend.clone(), config).unwrap();

    let started = Instant::now();
    let snapshot = mesh.monitor().run_cycle().await;

    assert_eq!(snapshot.per_service["fast"], HealthStatus::Passing);
    assert_eq!(snapshot.per_service["slow"], HealthStatus::Critical);
    assert!(snapshot.overall);
    assert!(started.elapsed() <= Duration::from_secs(2));

    // The verdict is per cycle.
    backend.set_probe_delay("slow-1", Duration::ZERO);
    let next = mesh.monitor().run_cycle().await;
    assert_eq!(next.cycle, 2);
    assert_eq!(next.per_service["slow"], HealthStatus::Passing);
}

#[tokio::test(start_paused = true)]
async fn test_required_warning_dependency_fails_overall() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.insert_instance(ServiceInstance::new("db", "db-1", "10.0.0.1", 5432));
    backend.set_health("db-1", HealthStatus::Warning);

    let config = MeshConfig::builder()
        .dependency(DependencyConfig::required("db"))
        .build();
    let mesh = MeshIntegrator::new(backend, config).unwrap();

    let snapshot = mesh.monitor().run_cycle().await;
    assert_eq!(snapshot.per_service["db"], HealthStatus::Warning);
    assert!(!snapshot.overall);
}

// ===== Partitions =====

#[tokio::test(start_paused = true)]
async fn test_partition_passes_through_degraded() {
    let backend = Arc::new(InMemoryRegistry::new());
    let config = MeshConfig::builder()
        .heartbeat_windows(Duration::from_secs(10), Duration::from_secs(30))
        .build();
    let mesh = MeshIntegrator::new(backend, config).unwrap();
    let partitions = mesh.partitions();

    let record = mesh
        .register_partition("p-1", "orders", BTreeMap::new())
        .await
        .unwrap();

    // Far past both windows: still one step per refresh.
    let later = record.last_heartbeat + chrono::Duration::minutes(10);
    assert_eq!(
        partitions.refresh(later, Duration::from_secs(1)).await,
        vec![("p-1".to_string(), PartitionStatus::Degraded)]
    );
    assert_eq!(
        partitions.refresh(later, Duration::from_secs(1)).await,
        vec![("p-1".to_string(), PartitionStatus::Unavailable)]
    );
    assert!(partitions.refresh(later, Duration::from_secs(1)).await.is_empty());

    let recovered = mesh.heartbeat("p-1").await.unwrap();
    assert_eq!(recovered.status, PartitionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_slow_partition_writes_do_not_stall_health_cycle() {
    let backend = Arc::new(InMemoryRegistry::new());
    let config = MeshConfig::builder()
        .probe_deadline(Duration::from_secs(3))
        .heartbeat_windows(Duration::from_millis(1), Duration::from_secs(3600))
        .build();
    let mesh = MeshIntegrator::new(backend.clone(), config).unwrap();
    for id in ["p-1", "p-2", "p-3", "p-4"] {
        mesh.register_partition(id, "orders", BTreeMap::new())
            .await
            .unwrap();
    }

    // Heartbeat windows are measured on the wall clock.
    std::thread::sleep(Duration::from_millis(5));
    backend.script("put_kv", Fault::Delay(Duration::from_secs(60)), 20);

    let started = Instant::now();
    let snapshot = mesh.monitor().run_cycle().await;

    assert!(started.elapsed() <= Duration::from_millis(3_100));
    assert_eq!(snapshot.per_partition.len(), 4);
    assert!(snapshot
        .per_partition
        .values()
        .all(|status| *status == PartitionStatus::Degraded));
}

#[tokio::test]
async fn test_partition_adopted_by_second_process() {
    let backend = Arc::new(InMemoryRegistry::new());
    let first = MeshIntegrator::new(backend.clone(), MeshConfig::default()).unwrap();
    let second = MeshIntegrator::new(backend, MeshConfig::default()).unwrap();

    let mut metadata = BTreeMap::new();
    metadata.insert("range".to_string(), "0-1023".to_string());
    first
        .register_partition("p-9", "orders", metadata.clone())
        .await
        .unwrap();

    assert!(second.query_partition("p-9").is_none());
    let adopted = second.partitions().adopt("p-9").await.unwrap();
    assert_eq!(adopted.owning_service, "orders");
    assert_eq!(adopted.metadata, metadata);
    assert_eq!(second.partition_owner("p-9").as_deref(), Some("orders"));
}

// ===== Health Endpoint =====

#[tokio::test(start_paused = true)]
async fn test_health_endpoint_follows_snapshot() {
    let backend = Arc::new(InMemoryRegistry::new());
    backend.insert_instance(ServiceInstance::new("db", "db-1", "10.0.0.1", 5432));
    let config = MeshConfig::builder()
        .dependency(DependencyConfig::required("db"))
        .build();
    let mesh = MeshIntegrator::new(backend.clone(), config).unwrap();
    let app = router(HealthState::new(mesh.subscribe_health()));

    let request = || Request::builder().uri("/health").body(Body::empty()).unwrap();

    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    mesh.monitor().run_cycle().await;
    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["overall"], true);
    assert_eq!(json["per_service"]["db"], "passing");

    backend.set_health("db-1", HealthStatus::Critical);
    mesh.monitor().run_cycle().await;
    let response = app.oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
