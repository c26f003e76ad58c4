//! Shared test fixtures: an in-memory `ManageConnection` and a counting
//! `Monitor`, the idiomatic stand-ins for a real backend and metrics sink in
//! these integration tests (mirrors how r2d2-style pools are exercised
//! against a fake manager rather than a live database).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use shardpool::{Error, Host, ManageConnection, Monitor, Operation};

#[derive(Debug, thiserror::Error)]
#[error("fake connect failure")]
pub struct FakeConnectError;

pub struct FakeConnection {
    pub host: Host,
}

/// A `ManageConnection` whose `connect` can be toggled to fail, for
/// exercising `prime_connections` failure and recovery paths without a real
/// socket.
pub struct FakeManager {
    host: Host,
    pub fail_connect: Arc<AtomicBool>,
}

impl FakeManager {
    pub fn new(host: Host) -> Self {
        FakeManager {
            host,
            fail_connect: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl ManageConnection for FakeManager {
    type Connection = FakeConnection;
    type Error = FakeConnectError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(FakeConnectError);
        }
        Ok(FakeConnection {
            host: self.host.clone(),
        })
    }

    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Per-host tallies, so tests can tell traffic shifting onto or away from a
/// particular host apart from the pool-wide totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCounters {
    pub op_success: u32,
    pub op_failure: u32,
    pub borrowed: u32,
    pub returned: u32,
}

/// Tallies every `Monitor` event with plain atomics (pool-wide) and a
/// locked map (per-host), so tests can assert on aggregate invariants
/// (created == closed at quiescence, borrowed == returned) as well as on
/// which host traffic actually landed on, without a real metrics backend.
#[derive(Debug, Default)]
pub struct CountingMonitor {
    pub hosts_added: AtomicU32,
    pub hosts_removed: AtomicU32,
    pub op_success: AtomicU32,
    pub op_failure: AtomicU32,
    pub failovers: AtomicU32,
    pub created: AtomicU32,
    pub create_failed: AtomicU32,
    pub closed: AtomicU32,
    pub borrowed: AtomicU32,
    pub returned: AtomicU32,
    per_host: Mutex<HashMap<Host, HostCounters>>,
}

impl CountingMonitor {
    /// Successful operations recorded against `host`.
    pub fn host_successes(&self, host: &Host) -> u32 {
        self.per_host
            .lock()
            .unwrap()
            .get(host)
            .map(|c| c.op_success)
            .unwrap_or(0)
    }

    /// Connections borrowed from `host`'s sub-pool.
    pub fn host_borrows(&self, host: &Host) -> u32 {
        self.per_host
            .lock()
            .unwrap()
            .get(host)
            .map(|c| c.borrowed)
            .unwrap_or(0)
    }

    fn with_host<F: FnOnce(&mut HostCounters)>(&self, host: &Host, f: F) {
        let mut map = self.per_host.lock().unwrap();
        f(map.entry(host.clone()).or_default());
    }
}

impl Monitor for CountingMonitor {
    fn host_added(&self, _host: &Host) {
        self.hosts_added.fetch_add(1, Ordering::SeqCst);
    }

    fn host_removed(&self, _host: &Host) {
        self.hosts_removed.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_operation_success(&self, host: &Host, _latency: Duration) {
        self.op_success.fetch_add(1, Ordering::SeqCst);
        self.with_host(host, |c| c.op_success += 1);
    }

    fn inc_operation_failure(&self, host: Option<&Host>, _err: &Error) {
        self.op_failure.fetch_add(1, Ordering::SeqCst);
        if let Some(host) = host {
            self.with_host(host, |c| c.op_failure += 1);
        }
    }

    fn inc_failover(&self, _host: &Host, _err: &Error) {
        self.failovers.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_connection_created(&self, _host: &Host) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_connection_create_failed(&self, _host: &Host) {
        self.create_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_connection_closed(&self, _host: &Host) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_connection_borrowed(&self, host: &Host) {
        self.borrowed.fetch_add(1, Ordering::SeqCst);
        self.with_host(host, |c| c.borrowed += 1);
    }

    fn inc_connection_returned(&self, host: &Host) {
        self.returned.fetch_add(1, Ordering::SeqCst);
        self.with_host(host, |c| c.returned += 1);
    }
}

/// A trivial op that always succeeds.
pub struct NoopOp;

#[async_trait]
impl Operation<FakeConnection> for NoopOp {
    type Output = ();

    async fn execute(&self, _conn: &mut FakeConnection) -> Result<Self::Output, Error> {
        Ok(())
    }
}

/// An op that always fails with a transient error, for retry-budget tests.
pub struct AlwaysTransientOp;

#[async_trait]
impl Operation<FakeConnection> for AlwaysTransientOp {
    type Output = ();

    async fn execute(&self, conn: &mut FakeConnection) -> Result<Self::Output, Error> {
        Err(Error::transient_for(Some(conn.host.clone()), "transient failure"))
    }
}

/// An op that fails with a fatal connection error whenever `fire` is set,
/// for error-rate eviction tests.
pub struct FatalWhenArmedOp {
    pub armed: Arc<AtomicBool>,
}

#[async_trait]
impl Operation<FakeConnection> for FatalWhenArmedOp {
    type Output = ();

    async fn execute(&self, conn: &mut FakeConnection) -> Result<Self::Output, Error> {
        if self.armed.load(Ordering::SeqCst) {
            Err(Error::fatal(conn.host.clone(), "fatal failure"))
        } else {
            Ok(())
        }
    }
}

/// An op that blocks until explicitly released, for exhaustion tests.
pub struct BlockUntilOp {
    pub gate: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Operation<FakeConnection> for BlockUntilOp {
    type Output = ();

    async fn execute(&self, _conn: &mut FakeConnection) -> Result<Self::Output, Error> {
        self.gate.notified().await;
        Ok(())
    }
}
