
use std::sync::Arc;

use harness::{backend_options, default_monitoring, roundtrip, BalancerHandle, EchoBackend};
use tcplb::proxy::{Backend, PassiveHealthMonitor};
use tokio::net::TcpListener;

#[tokio::test]
async fn dead_backend_leaves_rotation_within_failure_threshold() {
    // Reserve a port with no listener behind it.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let b2 = EchoBackend::spawn("Backend-2").await.unwrap();

    let balancer = BalancerHandle::spawn(vec![
        backend_options("Backend-1", dead_addr),
        backend_options("Backend-2", b2.addr),
    ])
    .await
    .unwrap();

    let mut failures = 0;
    let mut last_failed_attempt = None;

    for i in 0..10 {
        match roundtrip(balancer.listen_addr, format!("req-{}\n", i).as_bytes()).await {
            Ok(response) => {
                assert!(response.contains("Backend-2"), "response: {}", response);
            }
            Err(_) => {
                failures += 1;
                last_failed_attempt = Some(i);
            }
        }
    }

    // Round-robin sends at most FailureThreshold (3) connections into the
    // dead backend before it is marked unhealthy.
    assert!(failures <= 3, "{} attempts failed", failures);
    if let Some(last) = last_failed_attempt {
        assert!(last <= 5, "failure after the backend should have left rotation");
    }

    assert!(!balancer.backend_is_healthy("Backend-1"));
    assert!(balancer.backend_is_healthy("Backend-2"));
    assert_eq!(balancer.pool.healthy_count(), 1);

    balancer.stop();
}

#[tokio::test]
async fn all_traffic_flows_after_failover() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let b2 = EchoBackend::spawn("Backend-2").await.unwrap();

    let balancer = BalancerHandle::spawn(vec![
        backend_options("Backend-1", dead_addr),
        backend_options("Backend-2", b2.addr),
    ])
    .await
    .unwrap();

    // Drive connections until the dead backend is marked unhealthy.
    for i in 0..8 {
        let _ = roundtrip(balancer.listen_addr, format!("warm-{}\n", i).as_bytes()).await;
        if !balancer.backend_is_healthy("Backend-1") {
            break;
        }
    }
    assert!(!balancer.backend_is_healthy("Backend-1"));

    // Every further connection succeeds against the healthy backend.
    for i in 0..6 {
        let response = roundtrip(balancer.listen_addr, format!("req-{}\n", i).as_bytes())
            .await
            .unwrap();
        assert!(response.contains("Backend-2"), "response: {}", response);
    }

    balancer.stop();
}

#[tokio::test]
async fn backend_recovers_after_consecutive_successes() {
    let monitor = PassiveHealthMonitor::new(&default_monitoring());
    let backend = Backend::new(&backend_options(
        "Backend-1",
        "127.0.0.1:19301".parse().unwrap(),
    ));

    // FailureThreshold = 3: unhealthy after the third failure.
    monitor.record_failure(&backend);
    monitor.record_failure(&backend);
    assert!(backend.health().is_healthy());
    monitor.record_failure(&backend);
    assert!(!backend.health().is_healthy());

    // SuccessThreshold = 2: healthy again after the second success.
    monitor.record_success(&backend);
    assert!(!backend.health().is_healthy());
    monitor.record_success(&backend);
    assert!(backend.health().is_healthy());
}

#[tokio::test]
async fn restored_backend_rejoins_rotation() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let b2 = EchoBackend::spawn("Backend-2").await.unwrap();

    let balancer = BalancerHandle::spawn(vec![
        backend_options("Backend-1", dead_addr),
        backend_options("Backend-2", b2.addr),
    ])
    .await
    .unwrap();

    for i in 0..8 {
        let _ = roundtrip(balancer.listen_addr, format!("warm-{}\n", i).as_bytes()).await;
        if !balancer.backend_is_healthy("Backend-1") {
            break;
        }
    }
    assert!(!balancer.backend_is_healthy("Backend-1"));

    // Passive monitoring only observes selected backends, so an operator
    // (or an active prober) reports the recovery; successes then restore
    // the flag through the same threshold machinery.
    let restored = Arc::clone(
        balancer
            .pool
            .snapshot()
            .iter()
            .find(|b| b.name == "Backend-1")
            .unwrap(),
    );
    balancer.monitor.record_success(&restored);
    balancer.monitor.record_success(&restored);

    assert!(balancer.backend_is_healthy("Backend-1"));
    assert_eq!(balancer.pool.healthy_count(), 2);

    balancer.stop();
}
