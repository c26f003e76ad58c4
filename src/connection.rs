//! The `ManageConnection` trait: the pool's sole collaborator for producing
//! and validating physical connections.
//!
//! The wire protocol, socket, and handshake stay entirely behind this
//! boundary; the pool only ever calls `connect`, `is_valid`, and
//! `has_broken`.

use async_trait::async_trait;

/// A trait which provides host-specific connection management.
///
/// Implementors supply the logic to open a connection to a particular host
/// and to determine whether an existing connection is still usable. The
/// pool is otherwise agnostic to what `Connection` actually is.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The connection type this manager deals with.
    type Connection: Send + 'static;
    /// The error type returned by this manager's connections.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempt to create a new connection to the manager's host.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Determine whether `conn` is still usable, typically with a
    /// lightweight round trip (e.g. a ping).
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Synchronously determine whether a connection has definitely broken,
    /// without performing I/O, if the underlying transport exposes that.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;
}
