//! `HostConnectionPool`: a bounded pool of live connections to a single
//! host.
//!
//! Has an explicit lifecycle (`Initializing -> Active -> Draining ->
//! Closed`) and primes its connections eagerly on construction. Idle
//! connections and waiters queue behind a `tokio::sync::Semaphore` for
//! admission control, with an `oneshot` channel handing each waiter its
//! connection directly once one becomes available.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::timeout;

use crate::connection::ManageConnection;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::monitor::Monitor;

/// A boxed recovery job: re-establishing one discarded connection.
///
/// Submitted to the shared, single-worker recovery queue so that socket
/// creation across every host in the pool is serialized, bounding the rate
/// of new outbound connection attempts during a broad outage.
pub(crate) type RecoveryJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A handle to the shared recovery worker, cloned into every
/// `HostConnectionPool`.
#[derive(Clone)]
pub(crate) struct RecoveryHandle {
    tx: mpsc::UnboundedSender<RecoveryJob>,
}

impl RecoveryHandle {
    pub(crate) fn submit(&self, job: RecoveryJob) {
        // A closed receiver only happens once the top-level pool is
        // shutting down; dropping the job in that case is correct.
        let _ = self.tx.send(job);
    }
}

impl fmt::Debug for RecoveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryHandle")
    }
}

/// Spawn the single-worker recovery executor. Owned by the top-level
/// `ConnectionPool` and shared by every sub-pool.
pub(crate) fn spawn_recovery_worker() -> (RecoveryHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RecoveryJob>();
    let join = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job.await;
        }
    });
    (RecoveryHandle { tx }, join)
}

/// The lifecycle state of a [`HostConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Not yet primed; borrows are refused.
    Initializing,
    /// Primed and accepting borrows.
    Active,
    /// Shutting down: no new borrows, waiting for outstanding returns.
    Draining,
    /// Fully shut down: no connections remain, no borrows ever succeed again.
    Closed,
}

struct Conn<C> {
    conn: C,
    birth: Instant,
}

struct IdleConn<C> {
    conn: Conn<C>,
    idle_start: Instant,
}

struct Internals<C> {
    state: PoolState,
    waiters: VecDeque<oneshot::Sender<Conn<C>>>,
    idle: VecDeque<IdleConn<C>>,
    /// Physical connections currently live (borrowed + idle).
    num_conns: u32,
    /// Physical connections under construction (priming or recovery).
    pending_conns: u32,
}

/// A bounded pool of live connections to a single host.
///
/// Invariants: `borrowed + available <= connections_per_host` at all times,
/// `created - closed == borrowed + available`, and once `Closed`, no new
/// borrow ever succeeds.
pub struct HostConnectionPool<M: ManageConnection> {
    host: Host,
    manager: M,
    capacity: u32,
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    monitor: Arc<dyn Monitor>,
    recovery: RecoveryHandle,
    semaphore: Arc<Semaphore>,
    internals: Mutex<Internals<M::Connection>>,
    created_total: AtomicU32,
    closed_total: AtomicU32,
}

/// A borrowed connection. Must be returned to `HostConnectionPool` exactly
/// once via [`HostConnectionPool::return_connection`].
pub struct Connection<M: ManageConnection> {
    pool: Arc<HostConnectionPool<M>>,
    conn: Option<M::Connection>,
    birth: Instant,
    fatal: bool,
    returned: bool,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl<M: ManageConnection> Connection<M> {
    /// Borrow the underlying connection immutably.
    pub fn get(&self) -> &M::Connection {
        self.conn.as_ref().expect("connection taken")
    }

    /// Borrow the underlying connection mutably.
    pub fn get_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().expect("connection taken")
    }

    /// The host this connection belongs to.
    pub fn host(&self) -> &Host {
        self.pool.get_host()
    }

    /// Mark this connection's last error as fatal, so that returning it
    /// discards and replaces the physical connection instead of recycling
    /// it.
    pub fn mark_fatal(&mut self) {
        self.fatal = true;
    }

    /// The sub-pool this connection was borrowed from.
    pub fn parent_pool(&self) -> &Arc<HostConnectionPool<M>> {
        &self.pool
    }
}

impl<M: ManageConnection> fmt::Debug for HostConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConnectionPool")
            .field("host", &self.host)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<M: ManageConnection> fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("host", &self.pool.host).finish()
    }
}

impl<M: ManageConnection> Drop for Connection<M> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        // Safety net for a connection dropped without an explicit return
        // (e.g. a panic mid-operation). Spawn the return as a detached task
        // rather than blocking the dropping thread on the runtime.
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            let pool = self.pool.clone();
            let birth = self.birth;
            let fatal = self.fatal;
            tracing::warn!(host = %pool.get_host(), "connection dropped without explicit return");
            tokio::spawn(async move {
                pool.finish_return(conn, birth, fatal, permit).await;
            });
        }
    }
}

impl<M: ManageConnection> HostConnectionPool<M> {
    /// Construct a new, `Initializing` sub-pool. Call [`Self::prime_connections`]
    /// before admitting traffic.
    pub(crate) fn new(
        host: Host,
        manager: M,
        capacity: u32,
        idle_timeout: Option<Duration>,
        max_lifetime: Option<Duration>,
        monitor: Arc<dyn Monitor>,
        recovery: RecoveryHandle,
    ) -> Arc<Self> {
        Arc::new(HostConnectionPool {
            host,
            manager,
            capacity,
            idle_timeout,
            max_lifetime,
            monitor,
            recovery,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            internals: Mutex::new(Internals {
                state: PoolState::Initializing,
                waiters: VecDeque::new(),
                idle: VecDeque::new(),
                num_conns: 0,
                pending_conns: 0,
            }),
            created_total: AtomicU32::new(0),
            closed_total: AtomicU32::new(0),
        })
    }

    /// The host this sub-pool serves.
    pub fn get_host(&self) -> &Host {
        &self.host
    }

    /// `true` iff the sub-pool is currently `Active`.
    pub async fn is_active(&self) -> bool {
        self.internals.lock().await.state == PoolState::Active
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> PoolState {
        self.internals.lock().await.state
    }

    /// Number of physical connections created over this pool's lifetime.
    pub fn created_count(&self) -> u32 {
        self.created_total.load(Ordering::SeqCst)
    }

    /// Number of physical connections closed over this pool's lifetime.
    pub fn closed_count(&self) -> u32 {
        self.closed_total.load(Ordering::SeqCst)
    }

    async fn open_one(self: &Arc<Self>) -> Result<Conn<M::Connection>> {
        let mut conn = self
            .manager
            .connect()
            .await
            .map_err(|e| Error::transient(Some(self.host.clone()), Box::new(e)))?;
        self.manager
            .is_valid(&mut conn)
            .await
            .map_err(|e| Error::transient(Some(self.host.clone()), Box::new(e)))?;
        self.monitor.inc_connection_created(&self.host);
        self.created_total.fetch_add(1, Ordering::SeqCst);
        Ok(Conn {
            conn,
            birth: Instant::now(),
        })
    }

    /// Eagerly create `capacity` connections and transition to `Active`. If
    /// any single connect/validate fails, every connection created so far
    /// is closed and the pool fails with `PoolOffline`; the host never
    /// becomes `Active`.
    pub async fn prime_connections(self: &Arc<Self>) -> Result<()> {
        let mut created = Vec::with_capacity(self.capacity as usize);
        for _ in 0..self.capacity {
            match self.open_one().await {
                Ok(conn) => created.push(conn),
                Err(_) => {
                    self.monitor.inc_connection_create_failed(&self.host);
                    for conn in created {
                        self.close_one(conn.conn).await;
                    }
                    return Err(Error::pool_offline(self.host.clone()));
                }
            }
        }

        let mut internals = self.internals.lock().await;
        let now = Instant::now();
        internals.num_conns = created.len() as u32;
        for conn in created {
            internals.idle.push_back(IdleConn { conn, idle_start: now });
        }
        internals.state = PoolState::Active;
        Ok(())
    }

    async fn close_one(&self, mut conn: M::Connection) {
        let _ = self.manager.has_broken(&mut conn);
        drop(conn);
        self.monitor.inc_connection_closed(&self.host);
        self.closed_total.fetch_add(1, Ordering::SeqCst);
    }

    fn put_idle_locked(internals: &mut Internals<M::Connection>, conn: Conn<M::Connection>) {
        let mut conn = conn;
        loop {
            if let Some(waiter) = internals.waiters.pop_front() {
                match waiter.send(conn) {
                    Ok(()) => return,
                    Err(back) => conn = back,
                }
            } else {
                internals.idle.push_back(IdleConn {
                    conn,
                    idle_start: Instant::now(),
                });
                return;
            }
        }
    }

    /// Replace one discarded connection. Submitted to the shared recovery
    /// queue rather than run inline, so that socket churn across every
    /// host is serialized through a single worker.
    fn schedule_replacement(self: &Arc<Self>) {
        let pool = self.clone();
        self.recovery.submit(Box::pin(async move {
            let mut internals = pool.internals.lock().await;
            if internals.state != PoolState::Active {
                return;
            }
            internals.pending_conns += 1;
            drop(internals);

            let result = pool.open_one().await;

            let mut internals = pool.internals.lock().await;
            internals.pending_conns -= 1;
            match result {
                Ok(conn) => {
                    internals.num_conns += 1;
                    Self::put_idle_locked(&mut internals, conn);
                }
                Err(_) => {
                    pool.monitor.inc_connection_create_failed(&pool.host);
                }
            }
        }));
    }

    /// Borrow an available connection, blocking up to `timeout` for one to
    /// become free.
    ///
    /// On a non-`Active` pool, fails immediately with `PoolOffline`. If no
    /// connection becomes available (either because capacity is exhausted
    /// or because a replacement is still being created) before `timeout`
    /// elapses, fails with `PoolExhausted`.
    pub async fn borrow_connection(self: &Arc<Self>, budget: Duration) -> Result<Connection<M>> {
        {
            let internals = self.internals.lock().await;
            if internals.state != PoolState::Active {
                return Err(Error::pool_offline(self.host.clone()));
            }
        }

        let deadline = Instant::now() + budget;
        let semaphore = self.semaphore.clone();
        let permit = match timeout(remaining(deadline), semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(Error::pool_exhausted(self.host.clone())),
        };

        {
            let mut internals = self.internals.lock().await;
            if internals.state != PoolState::Active {
                return Err(Error::pool_offline(self.host.clone()));
            }
            if let Some(idle) = internals.idle.pop_front() {
                self.monitor.inc_connection_borrowed(&self.host);
                return Ok(Connection {
                    pool: self.clone(),
                    conn: Some(idle.conn.conn),
                    birth: idle.conn.birth,
                    fatal: false,
                    returned: false,
                    permit: Some(permit),
                });
            }

            // Capacity allows another borrow, but no physical connection is
            // ready yet (a replacement is in flight). Wait for one without
            // spinning, still bounded by the original timeout.
            let (tx, rx) = oneshot::channel();
            internals.waiters.push_back(tx);
            drop(internals);

            match timeout(remaining(deadline), rx).await {
                Ok(Ok(conn)) => {
                    self.monitor.inc_connection_borrowed(&self.host);
                    Ok(Connection {
                        pool: self.clone(),
                        conn: Some(conn.conn),
                        birth: conn.birth,
                        fatal: false,
                        returned: false,
                        permit: Some(permit),
                    })
                }
                Ok(Err(_)) | Err(_) => Err(Error::pool_exhausted(self.host.clone())),
            }
        }
    }

    /// Return a connection to the available set.
    ///
    /// If the connection's last error was fatal, it is closed and a
    /// replacement is scheduled on the shared recovery queue. Idempotent:
    /// returning the same connection twice is a logged no-op.
    pub async fn return_connection(self: &Arc<Self>, mut conn: Connection<M>) {
        if conn.returned {
            tracing::warn!(host = %self.host, "ignoring duplicate return of connection");
            return;
        }
        conn.returned = true;
        let inner = conn.conn.take().expect("connection present");
        let permit = conn.permit.take().expect("permit present");
        let birth = conn.birth;
        let fatal = conn.fatal;
        self.finish_return(inner, birth, fatal, permit).await;
    }

    async fn finish_return(
        self: &Arc<Self>,
        inner: M::Connection,
        birth: Instant,
        fatal: bool,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.monitor.inc_connection_returned(&self.host);
        drop(permit);
        let mut inner_conn = inner;
        let broken = fatal || self.manager.has_broken(&mut inner_conn);

        let state = self.internals.lock().await.state;
        if state == PoolState::Closed {
            // The pool finished shutting down while this connection was
            // still checked out; close it rather than reviving the pool's
            // idle queue (spec: "no operation may be in flight after
            // Closed").
            self.close_one(inner_conn).await;
            return;
        }

        if broken {
            {
                let mut internals = self.internals.lock().await;
                internals.num_conns -= 1;
            }
            self.close_one(inner_conn).await;
            self.schedule_replacement();
        } else {
            let mut internals = self.internals.lock().await;
            Self::put_idle_locked(
                &mut internals,
                Conn {
                    conn: inner_conn,
                    birth,
                },
            );
        }
    }

    /// Transition to `Draining`, stop admitting new borrows, wait up to
    /// `grace_period` for outstanding borrows to return, then close every
    /// connection and transition to `Closed`.
    pub async fn shutdown(self: &Arc<Self>, grace_period: Duration) {
        {
            let mut internals = self.internals.lock().await;
            if internals.state == PoolState::Closed {
                return;
            }
            internals.state = PoolState::Draining;
            for waiter in internals.waiters.drain(..) {
                drop(waiter);
            }
        }

        let deadline = Instant::now() + grace_period;
        loop {
            let outstanding = {
                let internals = self.internals.lock().await;
                (internals.num_conns as usize).saturating_sub(internals.idle.len())
            };
            if outstanding == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut internals = self.internals.lock().await;
        let idle = std::mem::take(&mut internals.idle);
        internals.state = PoolState::Closed;
        internals.num_conns = 0;
        drop(internals);

        for idle_conn in idle {
            self.close_one(idle_conn.conn.conn).await;
        }
        tracing::debug!(host = %self.host, "host sub-pool shut down");
    }

    /// Remove idle connections past `idle_timeout` or `max_lifetime`.
    /// Invoked periodically by the top-level pool's recovery worker.
    pub(crate) async fn reap(self: &Arc<Self>) {
        let now = Instant::now();
        let mut dropped = Vec::new();
        {
            let mut internals = self.internals.lock().await;
            if internals.state != PoolState::Active {
                return;
            }
            let idle_timeout = self.idle_timeout;
            let max_lifetime = self.max_lifetime;
            let mut keep = VecDeque::with_capacity(internals.idle.len());
            for idle_conn in internals.idle.drain(..) {
                let mut reap = false;
                if let Some(t) = idle_timeout {
                    reap |= now.duration_since(idle_conn.idle_start) >= t;
                }
                if let Some(t) = max_lifetime {
                    reap |= now.duration_since(idle_conn.conn.birth) >= t;
                }
                if reap {
                    dropped.push(idle_conn.conn.conn);
                } else {
                    keep.push_back(idle_conn);
                }
            }
            internals.idle = keep;
            internals.num_conns -= dropped.len() as u32;
        }

        for conn in dropped {
            self.close_one(conn).await;
            self.schedule_replacement();
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
