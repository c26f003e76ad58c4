//! The `Monitor` trait: the pool's sole collaborator for metrics.
//!
//! A narrow trait with a no-op default on every method, so an embedder can
//! override just the handful of counters it cares about.

use std::fmt;
use std::time::Duration;

use crate::error::Error;
use crate::host::Host;

/// Receives counters and latency events emitted by the pool.
///
/// No metrics aggregation, exporting, or storage happens in this crate;
/// implementors bridge to whatever metrics system the embedding application
/// uses.
pub trait Monitor: fmt::Debug + Send + Sync + 'static {
    /// A host was added to the pool and primed successfully.
    fn host_added(&self, _host: &Host) {}

    /// A host was removed from the pool (explicitly or via eviction).
    fn host_removed(&self, _host: &Host) {}

    /// An operation completed successfully. `latency` is wall-clock time
    /// from the start of `execute_with_failover`, not per-attempt.
    fn inc_operation_success(&self, _host: &Host, _latency: Duration) {}

    /// An operation failed. `host` is `None` only for `NoAvailableHosts`.
    fn inc_operation_failure(&self, _host: Option<&Host>, _err: &Error) {}

    /// A retry is about to be attempted on a different host after `host`
    /// failed.
    fn inc_failover(&self, _host: &Host, _err: &Error) {}

    /// A physical connection was created.
    fn inc_connection_created(&self, _host: &Host) {}

    /// A physical connection failed to be created.
    fn inc_connection_create_failed(&self, _host: &Host) {}

    /// A physical connection was closed.
    fn inc_connection_closed(&self, _host: &Host) {}

    /// A connection was handed out of a sub-pool.
    fn inc_connection_borrowed(&self, _host: &Host) {}

    /// A connection was returned to a sub-pool.
    fn inc_connection_returned(&self, _host: &Host) {}
}

/// A [`Monitor`] implementation that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopMonitor;

impl Monitor for NopMonitor {}
