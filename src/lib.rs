//! A client-side connection pool with automatic failover for a
//! sharded/clustered backend service.
//!
//! Callers submit opaque [`Operation`]s; the pool selects a healthy host via
//! a [`HostSelectionStrategy`], borrows a physical connection from that
//! host's [`HostConnectionPool`], executes the operation, observes the
//! outcome, and retries on another host according to a [`RetryPolicy`].
//! Unhealthy hosts are passively evicted based on a sliding error-rate
//! signal tracked by [`ConnectionPoolHealthTracker`].
//!
//! The wire protocol, the physical socket/handshake, and the metrics sink
//! are all external collaborators behind narrow traits
//! ([`ManageConnection`] and [`Monitor`] respectively) — this crate owns
//! only the coordination fabric: host tracking, dispatch, retries, and
//! eviction.
//!
//! ```no_run
//! use std::time::Duration;
//! use shardpool::{ConnectionPool, Host, PoolConfig, RetryNTimesFactory};
//!
//! # async fn demo<M: shardpool::ManageConnection>(manager_factory: impl Fn(&Host) -> M + Send + Sync + 'static) {
//! let pool = ConnectionPool::new(
//!     PoolConfig::default(),
//!     RetryNTimesFactory::new(3),
//!     manager_factory,
//! );
//! pool.add_host(Host::new("db1.internal", 5432)).await;
//! # }
//! ```

#![deny(missing_debug_implementations)]

mod connection;
mod error;
mod health;
mod host;
mod host_pool;
mod monitor;
mod operation;
mod pool;
mod retry;
mod selection;

pub use connection::ManageConnection;
pub use error::{BoxError, Error, ErrorKind, Result};
pub use health::{ConnectionPoolHealthTracker, ErrorRateConfig, ErrorRateMonitor, ErrorRateRule};
pub use host::Host;
pub use host_pool::{Connection, HostConnectionPool, PoolState};
pub use monitor::{Monitor, NopMonitor};
pub use operation::{AsyncOperation, FnOperation, Operation, OperationResult};
pub use pool::{AsyncReturnPolicy, ConnectionPool, PoolConfig};
pub use retry::{RetryNTimes, RetryNTimesFactory, RetryPolicy, RetryPolicyFactory};
pub use selection::{HostSelectionStrategy, RoundRobin};
