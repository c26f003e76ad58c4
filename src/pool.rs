//! `ConnectionPool`: the top-level pool. Lifecycle, dispatch, failover,
//! eviction.
//!
//! Hosts are tracked in a topology-keyed map guarded by a lock only on the
//! add/remove path; the operation hot path reads an `arc_swap` snapshot of
//! currently active sub-pools instead, so dispatch never contends with
//! topology changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::connection::ManageConnection;
use crate::error::{Error, Result};
use crate::health::{ConnectionPoolHealthTracker, ErrorRateConfig};
use crate::host::Host;
use crate::host_pool::{spawn_recovery_worker, HostConnectionPool, RecoveryHandle};
use crate::monitor::{Monitor, NopMonitor};
use crate::operation::{AsyncOperation, Operation, OperationResult};
use crate::retry::{RetryPolicy, RetryPolicyFactory};
use crate::selection::{empty_snapshot, HostSelectionStrategy, PoolSnapshot, RoundRobin};

/// Configuration recognized by [`ConnectionPool::new`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections eagerly created and held open per host.
    pub connections_per_host: u32,
    /// How long `execute_with_failover` and `borrow_connection` may block
    /// waiting for a connection before giving up on a host.
    pub max_timeout_when_exhausted: Duration,
    /// How long `shutdown` waits for outstanding borrows to return before
    /// forcibly closing every connection.
    pub shutdown_grace_period: Duration,
    /// Idle connections older than this are reaped and replaced. `None`
    /// disables idle reaping.
    pub idle_timeout: Option<Duration>,
    /// Connections older than this (regardless of idle time) are reaped and
    /// replaced. `None` disables lifetime reaping.
    pub max_lifetime: Option<Duration>,
    /// How often the background reaper sweeps every host pool.
    pub reap_interval: Duration,
    /// Error-rate eviction configuration, shared by every host's monitor.
    pub error_rate: ErrorRateConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            connections_per_host: 4,
            max_timeout_when_exhausted: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(5),
            idle_timeout: None,
            max_lifetime: None,
            reap_interval: Duration::from_secs(30),
            error_rate: ErrorRateConfig::default(),
        }
    }
}

/// Whether [`ConnectionPool::execute_async`] returns the connection to its
/// sub-pool before or after the dispatched future resolves.
///
/// Defaults to `BeforeCompletion`: the connection goes back to the sub-pool
/// as soon as the future is handed back, before it resolves. This assumes
/// the dispatched operation does not keep touching the connection after
/// that point; callers whose operations do should opt into
/// `AfterCompletion` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncReturnPolicy {
    /// Return to the sub-pool as soon as the future is obtained, before it
    /// resolves.
    #[default]
    BeforeCompletion,
    /// Await the future to completion before returning the connection.
    AfterCompletion,
}

struct Inner<M: ManageConnection, RPF, S> {
    manager_factory: Box<dyn Fn(&Host) -> M + Send + Sync>,
    config: PoolConfig,
    monitor: Arc<dyn Monitor>,
    retry_factory: RPF,
    selector: S,
    hosts: RwLock<HashMap<Host, Arc<HostConnectionPool<M>>>>,
    snapshot: PoolSnapshot<M>,
    health: ConnectionPoolHealthTracker,
    recovery: RecoveryHandle,
    recovery_join: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    async_return_policy: AsyncReturnPolicy,
}

/// The top-level pool: tracks hosts, dispatches operations with failover,
/// applies retries, and passively evicts unhealthy hosts.
///
/// Cloning a `ConnectionPool` is cheap and shares all state — it's just a
/// handle around `Arc<Inner<M, RPF, S>>`.
pub struct ConnectionPool<M: ManageConnection, RPF: RetryPolicyFactory, S = RoundRobin> {
    inner: Arc<Inner<M, RPF, S>>,
}

impl<M: ManageConnection, RPF: RetryPolicyFactory, S> Clone for ConnectionPool<M, RPF, S> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection, RPF: RetryPolicyFactory, S> std::fmt::Debug for ConnectionPool<M, RPF, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("ConnectionPool({:p})", self.inner))
    }
}

impl<M: ManageConnection, RPF: RetryPolicyFactory> ConnectionPool<M, RPF, RoundRobin> {
    /// Build a pool with the default [`RoundRobin`] selection strategy.
    ///
    /// `manager_factory` produces a fresh `M` bound to a given `Host` each
    /// time `add_host` primes a new sub-pool.
    pub fn new(
        config: PoolConfig,
        retry_factory: RPF,
        manager_factory: impl Fn(&Host) -> M + Send + Sync + 'static,
    ) -> Self {
        Self::with_selector(config, retry_factory, manager_factory, RoundRobin::new())
    }
}

impl<M: ManageConnection, RPF: RetryPolicyFactory, S: HostSelectionStrategy<M>>
    ConnectionPool<M, RPF, S>
{
    /// Build a pool with an explicit [`HostSelectionStrategy`].
    pub fn with_selector(
        config: PoolConfig,
        retry_factory: RPF,
        manager_factory: impl Fn(&Host) -> M + Send + Sync + 'static,
        selector: S,
    ) -> Self {
        let (recovery, join) = spawn_recovery_worker();
        let inner = Inner {
            manager_factory: Box::new(manager_factory),
            health: ConnectionPoolHealthTracker::new(config.error_rate.clone()),
            monitor: Arc::new(NopMonitor),
            config,
            retry_factory,
            selector,
            hosts: RwLock::new(HashMap::new()),
            snapshot: empty_snapshot(),
            recovery,
            recovery_join: tokio::sync::Mutex::new(Some(join)),
            async_return_policy: AsyncReturnPolicy::default(),
        };
        ConnectionPool {
            inner: Arc::new(inner),
        }
    }

    /// Replace the default no-op [`Monitor`] with a real collaborator.
    /// Must be called before any host is added.
    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_monitor called after the pool was cloned or shared")
            .monitor = monitor;
        self
    }

    /// Opt into [`AsyncReturnPolicy::AfterCompletion`] for `execute_async`.
    /// Must be called before any host is added.
    pub fn with_async_return_policy(mut self, policy: AsyncReturnPolicy) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_async_return_policy called after the pool was cloned or shared")
            .async_return_policy = policy;
        self
    }

    async fn publish_snapshot(&self, hosts: &HashMap<Host, Arc<HostConnectionPool<M>>>) {
        let mut pools: Vec<Arc<HostConnectionPool<M>>> = Vec::with_capacity(hosts.len());
        for pool in hosts.values() {
            if pool.is_active().await {
                pools.push(pool.clone());
            }
        }
        self.inner.snapshot.store(Arc::new(pools));
    }

    /// Atomically insert a new sub-pool for `host` if absent, then prime it.
    ///
    /// Returns `true` iff the host is now present and `Active`. If priming
    /// fails, the insertion is rolled back and `false` is returned.
    /// Idempotent: a second call for an already-present host returns
    /// `false` without reinserting.
    pub async fn add_host(&self, host: Host) -> bool {
        let mut hosts = self.inner.hosts.write().await;
        if hosts.contains_key(&host) {
            return false;
        }

        let manager = (self.inner.manager_factory)(&host);
        let pool = HostConnectionPool::new(
            host.clone(),
            manager,
            self.inner.config.connections_per_host,
            self.inner.config.idle_timeout,
            self.inner.config.max_lifetime,
            self.inner.monitor.clone(),
            self.inner.recovery.clone(),
        );

        if let Err(err) = pool.prime_connections().await {
            tracing::warn!(%host, %err, "failed to prime host, rolling back add_host");
            return false;
        }

        hosts.insert(host.clone(), pool);
        self.publish_snapshot(&hosts).await;
        drop(hosts);
        self.inner.monitor.host_added(&host);
        true
    }

    /// Remove `host`, de-register it from selection, and shut down its
    /// sub-pool in the background. Idempotent.
    pub async fn remove_host(&self, host: &Host) -> bool {
        let removed = {
            let mut hosts = self.inner.hosts.write().await;
            let removed = hosts.remove(host);
            if removed.is_some() {
                self.publish_snapshot(&hosts).await;
            }
            removed
        };

        let Some(pool) = removed else {
            return false;
        };

        self.inner.monitor.host_removed(host);
        self.inner.health.forget(host).await;
        let grace = self.inner.config.shutdown_grace_period;
        tokio::spawn(async move {
            pool.shutdown(grace).await;
        });
        true
    }

    /// `true` iff `host` has a registered sub-pool (in any state).
    pub async fn has_host(&self, host: &Host) -> bool {
        self.inner.hosts.read().await.contains_key(host)
    }

    /// `true` iff `host`'s sub-pool is registered and `Active`.
    pub async fn is_host_up(&self, host: &Host) -> bool {
        match self.inner.hosts.read().await.get(host) {
            Some(pool) => pool.is_active().await,
            None => false,
        }
    }

    /// Every registered sub-pool, regardless of state.
    pub async fn get_pools(&self) -> Vec<Arc<HostConnectionPool<M>>> {
        self.inner.hosts.read().await.values().cloned().collect()
    }

    /// The lock-free snapshot of currently `Active` sub-pools, as seen by
    /// the selector.
    pub fn get_active_pools(&self) -> Vec<Arc<HostConnectionPool<M>>> {
        (**self.inner.snapshot.load()).clone()
    }

    /// The sub-pool registered for `host`, if any.
    pub async fn get_host_pool(&self, host: &Host) -> Option<Arc<HostConnectionPool<M>>> {
        self.inner.hosts.read().await.get(host).cloned()
    }

    /// Apply `up` additions then `down` removals. Returns whether anything
    /// changed; both batches complete before this returns.
    pub async fn update_hosts(&self, up: Vec<Host>, down: Vec<Host>) -> bool {
        let mut changed = false;
        for host in up {
            changed |= self.add_host(host).await;
        }
        for host in &down {
            changed |= self.remove_host(host).await;
        }
        changed
    }

    /// Prime every currently registered host. Intended to be called once at
    /// startup after a batch of `add_host` calls made while the pool was
    /// not yet serving traffic; in this design `add_host` already primes
    /// eagerly, so `start` is a no-op cross-check that every registered
    /// host is up before traffic begins.
    pub async fn start(&self) -> bool {
        let hosts = self.inner.hosts.read().await;
        let mut all_up = true;
        for pool in hosts.values() {
            all_up &= pool.is_active().await;
        }
        all_up
    }

    /// Remove every host, then stop the shared recovery worker.
    pub async fn shutdown(&self) {
        let hosts: Vec<Host> = self.inner.hosts.read().await.keys().cloned().collect();
        for host in &hosts {
            self.remove_host(host).await;
        }

        if let Some(join) = self.inner.recovery_join.lock().await.take() {
            join.abort();
        }
    }

    /// Execute `op` against a host selected via the failover algorithm,
    /// retrying per `RPF`'s policy until it succeeds, exhausts retries, or
    /// hits a terminal error.
    ///
    /// The selected connection is always returned before the next retry;
    /// retries land on a new host as a property of the selector's
    /// round-robin advance; latency reported on success is wall-clock from
    /// entry.
    pub async fn execute_with_failover<O>(&self, op: &O) -> Result<OperationResult<O::Output>>
    where
        O: Operation<M::Connection>,
    {
        let start_time = Instant::now();
        let mut retry = self.inner.retry_factory.new_policy();
        retry.begin();
        let mut last_error: Option<Error> = None;

        loop {
            let pools = self.get_active_pools();
            let borrowed = self
                .inner
                .selector
                .try_borrow(&pools, self.inner.config.max_timeout_when_exhausted)
                .await;

            let (host, mut conn, result) = match borrowed {
                Err(e) if e.is_terminal() => {
                    self.inner.monitor.inc_operation_failure(None, &e);
                    return Err(e);
                }
                Err(e) => {
                    retry.failure(&e);
                    last_error = Some(e.clone());
                    self.inner.monitor.inc_operation_failure(None, &e);
                    if !retry.allow_retry() {
                        return Err(last_error.expect("set above"));
                    }
                    continue;
                }
                Ok((_idx, mut conn)) => {
                    let host = conn.host().clone();
                    let result = op.execute(conn.get_mut()).await;
                    (host, conn, result)
                }
            };

            match result {
                Ok(value) => {
                    retry.success();
                    self.inner
                        .monitor
                        .inc_operation_success(&host, start_time.elapsed());
                    let attempt = retry.attempt_count() + 1;
                    conn.parent_pool().clone().return_connection(conn).await;
                    return Ok(OperationResult {
                        host,
                        latency: start_time.elapsed(),
                        attempt,
                        value,
                    });
                }
                Err(err) => {
                    if err.is_fatal_connection() {
                        conn.mark_fatal();
                    }
                    let terminal = err.is_terminal();
                    if !terminal {
                        retry.failure(&err);
                    }
                    last_error = Some(err.clone());
                    self.inner.monitor.inc_operation_failure(Some(&host), &err);
                    if !terminal && retry.allow_retry() {
                        self.inner.monitor.inc_failover(&host, &err);
                    }
                    if self.inner.health.track_connection_error(&host, &err).await {
                        self.remove_host(&host).await;
                    }
                    conn.parent_pool().clone().return_connection(conn).await;
                    if terminal || !retry.allow_retry() {
                        return Err(last_error.expect("set above"));
                    }
                }
            }
        }
    }

    /// Select a host, dispatch `op`, and return its future without
    /// retrying. A single attempt is made; failures at selection or
    /// dispatch are reported but never trigger failover.
    ///
    /// The connection is returned to its sub-pool according to
    /// [`AsyncReturnPolicy`] — by default immediately after dispatch,
    /// before the returned future resolves.
    pub async fn execute_async<O>(
        &self,
        op: &O,
    ) -> Result<std::pin::Pin<Box<dyn std::future::Future<Output = Result<O::Output>> + Send>>>
    where
        O: AsyncOperation<M::Connection>,
    {
        let pools = self.get_active_pools();
        let (_idx, mut conn) = self
            .inner
            .selector
            .try_borrow(&pools, self.inner.config.max_timeout_when_exhausted)
            .await
            .map_err(|e| {
                self.inner.monitor.inc_operation_failure(None, &e);
                e
            })?;

        let fut = op.execute_async(conn.get_mut());

        match self.inner.async_return_policy {
            AsyncReturnPolicy::BeforeCompletion => {
                conn.parent_pool().clone().return_connection(conn).await;
                Ok(fut)
            }
            AsyncReturnPolicy::AfterCompletion => {
                let pool = conn.parent_pool().clone();
                Ok(Box::pin(async move {
                    let result = fut.await;
                    pool.return_connection(conn).await;
                    result
                }))
            }
        }
    }

    /// Run the background idle/lifetime reaper for every registered host
    /// once. Intended to be driven by a caller-owned interval timer (e.g.
    /// `tokio::time::interval(config.reap_interval)`); this crate does not
    /// spawn that loop itself so embedders control the runtime's task
    /// topology.
    pub async fn reap_once(&self) {
        let hosts = self.inner.hosts.read().await;
        for pool in hosts.values() {
            pool.reap().await;
        }
    }
}
