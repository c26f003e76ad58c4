//! Integration tests against the in-memory fixtures in `support.rs`,
//! covering the scenarios and invariants this crate is built around.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use shardpool::{
    ConnectionPool, ErrorRateConfig, ErrorRateRule, Host, PoolConfig, RetryNTimesFactory,
};

use support::{
    AlwaysTransientOp, BlockUntilOp, CountingMonitor, FakeManager, FatalWhenArmedOp, NoopOp,
};

fn config(connections_per_host: u32) -> PoolConfig {
    PoolConfig {
        connections_per_host,
        max_timeout_when_exhausted: Duration::from_millis(200),
        shutdown_grace_period: Duration::from_millis(200),
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn executes_successfully_against_a_single_host() {
    let monitor = Arc::new(CountingMonitor::default());
    let pool = ConnectionPool::new(config(2), RetryNTimesFactory::new(2), |h: &Host| {
        FakeManager::new(h.clone())
    })
    .with_monitor(monitor.clone());

    let host = Host::new("h1", 1000);
    assert!(pool.add_host(host.clone()).await);
    assert!(pool.has_host(&host).await);
    assert!(pool.is_host_up(&host).await);

    let result = pool.execute_with_failover(&NoopOp).await.unwrap();
    assert_eq!(result.host, host);
    assert_eq!(result.attempt, 1);

    assert_eq!(monitor.op_success.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.borrowed.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.returned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_add_host_is_idempotent() {
    let pool = ConnectionPool::new(config(1), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    });
    let host = Host::new("h1", 1000);
    assert!(pool.add_host(host.clone()).await);
    assert!(!pool.add_host(host.clone()).await);
    assert_eq!(pool.get_pools().await.len(), 1);
}

#[tokio::test]
async fn remove_host_deregisters_it() {
    let pool = ConnectionPool::new(config(1), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    });
    let host = Host::new("h1", 1000);
    assert!(pool.add_host(host.clone()).await);
    assert!(pool.remove_host(&host).await);
    assert!(!pool.has_host(&host).await);
    // Idempotent: a second removal reports no change.
    assert!(!pool.remove_host(&host).await);
}

#[tokio::test]
async fn no_hosts_fails_fast_without_retrying() {
    let pool = ConnectionPool::new(config(1), RetryNTimesFactory::new(3), |h: &Host| {
        FakeManager::new(h.clone())
    });

    let err = pool.execute_with_failover(&NoopOp).await.unwrap_err();
    assert!(matches!(err.kind(), shardpool::ErrorKind::NoAvailableHosts));
}

#[tokio::test]
async fn failover_tries_every_host_before_giving_up() {
    let pool = ConnectionPool::new(config(1), RetryNTimesFactory::new(5), |h: &Host| {
        FakeManager::new(h.clone())
    });

    let h1 = Host::new("h1", 1000);
    let h2 = Host::new("h2", 1000);
    assert!(pool.add_host(h1.clone()).await);
    assert!(pool.add_host(h2.clone()).await);

    // Every call against AlwaysTransientOp eventually exhausts the retry
    // budget and fails, but must have tried more than once.
    let err = pool.execute_with_failover(&AlwaysTransientOp).await.unwrap_err();
    assert!(matches!(err.kind(), shardpool::ErrorKind::Transient { .. }));
}

#[tokio::test]
async fn retry_budget_is_exhausted_after_n_failures() {
    use shardpool::{RetryPolicy, RetryPolicyFactory as _};

    let factory = RetryNTimesFactory::new(3);
    let mut policy = factory.new_policy();
    policy.begin();

    let pool = ConnectionPool::new(config(1), RetryNTimesFactory::new(3), |h: &Host| {
        FakeManager::new(h.clone())
    });
    let host = Host::new("h1", 1000);
    assert!(pool.add_host(host.clone()).await);

    let err = pool.execute_with_failover(&AlwaysTransientOp).await.unwrap_err();
    assert!(matches!(err.kind(), shardpool::ErrorKind::Transient { .. }));

    // A freestanding policy with the same limit, driven the same number of
    // times, must report exactly the configured limit (spec invariant 5).
    for _ in 0..3 {
        policy.failure(&err);
    }
    assert_eq!(policy.attempt_count(), 3);
    assert!(!policy.allow_retry());
}

#[tokio::test]
async fn exhausted_pool_times_out_with_pool_exhausted() {
    let pool = ConnectionPool::new(config(1), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    });
    let host = Host::new("h1", 1000);
    assert!(pool.add_host(host.clone()).await);

    let gate = Arc::new(tokio::sync::Notify::new());
    let blocker = BlockUntilOp { gate: gate.clone() };

    let pool_clone = pool.clone();
    let holder = tokio::spawn(async move {
        let _ = pool_clone.execute_with_failover(&blocker).await;
    });

    // Give the holder time to borrow the sub-pool's only connection.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pool.execute_with_failover(&NoopOp).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        shardpool::ErrorKind::PoolExhausted { .. }
    ));

    gate.notify_one();
    holder.await.unwrap();
}

#[tokio::test]
async fn fatal_errors_evict_the_host_via_error_rate_monitor() {
    let monitor = Arc::new(CountingMonitor::default());
    let mut cfg = config(2);
    cfg.error_rate = ErrorRateConfig {
        check_frequency: Duration::from_millis(100),
        window: Duration::from_secs(5),
        suppress_window: Duration::from_secs(60),
        rules: vec![ErrorRateRule::new(2, Duration::from_secs(5), 10)],
    };
    let pool = ConnectionPool::new(cfg, RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    })
    .with_monitor(monitor.clone());

    let host = Host::new("h1", 1000);
    assert!(pool.add_host(host.clone()).await);

    let armed = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let op = FatalWhenArmedOp { armed: armed.clone() };

    for _ in 0..3 {
        let _ = pool.execute_with_failover(&op).await;
    }

    // Give the fire-and-forget shutdown spawned by remove_host a moment to
    // run; eviction itself happens synchronously inside execute_with_failover.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pool.has_host(&host).await);
}

#[tokio::test]
async fn quiescent_borrow_and_return_counters_match() {
    let monitor = Arc::new(CountingMonitor::default());
    let pool = ConnectionPool::new(config(3), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    })
    .with_monitor(monitor.clone());

    let h1 = Host::new("h1", 1000);
    let h2 = Host::new("h2", 1000);
    pool.add_host(h1.clone()).await;
    pool.add_host(h2.clone()).await;

    for _ in 0..20 {
        pool.execute_with_failover(&NoopOp).await.unwrap();
    }

    assert_eq!(
        monitor.borrowed.load(Ordering::SeqCst),
        monitor.returned.load(Ordering::SeqCst)
    );
    assert_eq!(monitor.created.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn shutdown_closes_every_created_connection() {
    let monitor = Arc::new(CountingMonitor::default());
    let pool = ConnectionPool::new(config(2), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    })
    .with_monitor(monitor.clone());

    let host = Host::new("h1", 1000);
    pool.add_host(host.clone()).await;
    pool.execute_with_failover(&NoopOp).await.unwrap();

    pool.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        monitor.created.load(Ordering::SeqCst),
        monitor.closed.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn hot_add_shifts_some_traffic_onto_the_new_host() {
    let monitor = Arc::new(CountingMonitor::default());
    let pool = ConnectionPool::new(config(2), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    })
    .with_monitor(monitor.clone());

    let h1 = Host::new("h1", 1000);
    let h2 = Host::new("h2", 1000);
    assert!(pool.add_host(h1.clone()).await);

    for _ in 0..10 {
        pool.execute_with_failover(&NoopOp).await.unwrap();
    }
    assert_eq!(monitor.host_successes(&h1), 10);
    assert_eq!(monitor.host_successes(&h2), 0);

    assert!(pool.add_host(h2.clone()).await);

    for _ in 0..10 {
        pool.execute_with_failover(&NoopOp).await.unwrap();
    }

    // Round-robin selection picks up the newly added host immediately; it
    // must have taken a share of the traffic issued after the add.
    assert!(monitor.host_successes(&h2) > 0);
    assert_eq!(
        monitor.host_successes(&h1) + monitor.host_successes(&h2),
        20
    );
}

#[tokio::test]
async fn hot_remove_stops_routing_to_the_removed_host() {
    let monitor = Arc::new(CountingMonitor::default());
    let pool = ConnectionPool::new(config(2), RetryNTimesFactory::new(1), |h: &Host| {
        FakeManager::new(h.clone())
    })
    .with_monitor(monitor.clone());

    let h1 = Host::new("h1", 1000);
    let h2 = Host::new("h2", 1000);
    assert!(pool.add_host(h1.clone()).await);
    assert!(pool.add_host(h2.clone()).await);

    for _ in 0..10 {
        pool.execute_with_failover(&NoopOp).await.unwrap();
    }
    assert!(monitor.host_successes(&h1) > 0);
    assert!(monitor.host_successes(&h2) > 0);

    assert!(pool.remove_host(&h1).await);
    let successes_on_h1_at_removal = monitor.host_successes(&h1);

    for _ in 0..10 {
        pool.execute_with_failover(&NoopOp).await.unwrap();
    }

    // No traffic issued after the removal may land on the removed host; it
    // must all have gone to the one remaining host.
    assert_eq!(monitor.host_successes(&h1), successes_on_h1_at_removal);
    assert_eq!(monitor.host_successes(&h2), 20 - successes_on_h1_at_removal);
}

#[tokio::test]
async fn add_host_rolls_back_when_priming_fails() {
    let manager_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let manager_fail_for_factory = manager_fail.clone();
    let pool = ConnectionPool::new(config(2), RetryNTimesFactory::new(1), move |h: &Host| {
        let m = FakeManager::new(h.clone());
        m.fail_connect.store(
            manager_fail_for_factory.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );
        m
    });

    let host = Host::new("h1", 1000);
    assert!(!pool.add_host(host.clone()).await);
    assert!(!pool.has_host(&host).await);
}
