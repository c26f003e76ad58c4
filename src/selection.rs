//! `RoundRobin`: lock-free host selection over the top-level pool's current
//! set of active sub-pools.
//!
//! The pool publishes its set of active sub-pools as an `ArcSwap` snapshot;
//! a selector reads that snapshot once per call and is otherwise free of
//! locks, so selection never contends with `add_host`/`remove_host`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::connection::ManageConnection;
use crate::error::Error;
use crate::host_pool::{Connection, HostConnectionPool};

/// Picks the next host pool to try.
///
/// Implementations read a snapshot of the current active pools; they never
/// hold a lock across a `borrow_connection` call.
pub trait HostSelectionStrategy<M: ManageConnection>: Send + Sync {
    /// Borrow a connection from one of `pools`, trying as many as necessary
    /// to honor the strategy's failover order, each bounded by `budget`.
    ///
    /// Returns the borrowed connection together with the index into `pools`
    /// it came from, or the last error observed if every pool refused.
    fn try_borrow<'a>(
        &self,
        pools: &'a [Arc<HostConnectionPool<M>>],
        budget: Duration,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(usize, Connection<M>), Error>> + Send + 'a>,
    >;
}

/// A lock-free round-robin selector.
///
/// Holds only an `AtomicUsize` counter; the set of candidate pools is passed
/// in per call as a snapshot taken from the top-level pool's
/// `arc_swap::ArcSwap`, so a concurrent `add_host`/`remove_host` never blocks
/// or corrupts an in-flight selection.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Construct a fresh round-robin selector starting at position 0.
    pub fn new() -> Self {
        RoundRobin {
            counter: AtomicUsize::new(0),
        }
    }
}

impl<M: ManageConnection> HostSelectionStrategy<M> for RoundRobin {
    fn try_borrow<'a>(
        &self,
        pools: &'a [Arc<HostConnectionPool<M>>],
        budget: Duration,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(usize, Connection<M>), Error>> + Send + 'a>,
    > {
        let len = pools.len();
        let start = if len == 0 {
            0
        } else {
            self.counter.fetch_add(1, Ordering::Relaxed) % len
        };
        Box::pin(async move {
            if len == 0 {
                return Err(Error::no_available_hosts());
            }

            let mut last_err = None;
            for offset in 0..len {
                let idx = (start + offset) % len;
                match pools[idx].borrow_connection(budget).await {
                    Ok(conn) => return Ok((idx, conn)),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.expect("at least one pool was tried"))
        })
    }
}

/// A read-only, atomically-swapped snapshot of the active host pools,
/// published by the top-level pool after every `add_host`/`remove_host`.
pub(crate) type PoolSnapshot<M> = ArcSwap<Vec<Arc<HostConnectionPool<M>>>>;

pub(crate) fn empty_snapshot<M: ManageConnection>() -> PoolSnapshot<M> {
    ArcSwap::from_pointee(Vec::new())
}
