//! The operation capability.
//!
//! Design note 9: "an Operation is `{execute(client, context) -> R, name,
//! key}`... model as a function value or a small interface; no runtime
//! discovery needed." This module defines exactly that, plus the async
//! variant `execute_with_failover`'s sibling `execute_async` dispatches to.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::host::Host;

/// An operation executed synchronously (from the pool's perspective) against
/// a borrowed connection, with failover.
#[async_trait]
pub trait Operation<C>: Send + Sync {
    /// The value produced on success.
    type Output: Send;

    /// Run this operation against `conn`.
    async fn execute(&self, conn: &mut C) -> Result<Self::Output, Error>;

    /// A human-readable name, used only for logging/diagnostics.
    fn name(&self) -> &str {
        "operation"
    }
}

/// An operation dispatched via `execute_async`: a single attempt is made,
/// the connection is returned to its sub-pool immediately (see
/// [`crate::pool::AsyncReturnPolicy`]), and the returned future is the
/// caller's sole contract — the pool does not await it and does not retry
/// it.
#[async_trait]
pub trait AsyncOperation<C>: Send + Sync {
    /// The value produced on success.
    type Output: Send + 'static;

    /// Dispatch this operation against `conn`, returning a future that
    /// resolves independently of the connection's borrow.
    fn execute_async(
        &self,
        conn: &mut C,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output, Error>> + Send>>;

    /// A human-readable name, used only for logging/diagnostics.
    fn name(&self) -> &str {
        "async_operation"
    }
}

/// Wraps a plain async closure so it satisfies [`Operation`] without a
/// dedicated type per call site.
pub struct FnOperation<F> {
    name: &'static str,
    f: F,
}

impl<F> FnOperation<F> {
    /// Wrap `f` as an anonymous, named operation.
    pub fn new(name: &'static str, f: F) -> Self {
        FnOperation { name, f }
    }
}

impl<F> std::fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOperation").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<C, F, Fut, T> Operation<C> for FnOperation<F>
where
    C: Send,
    F: Fn(&mut C) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, Error>> + Send,
    T: Send,
{
    type Output = T;

    async fn execute(&self, conn: &mut C) -> Result<T, Error> {
        (self.f)(conn).await
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// The outcome of a successful [`crate::ConnectionPool::execute_with_failover`]
/// call.
#[derive(Debug, Clone)]
pub struct OperationResult<R> {
    /// The host that ultimately served the operation.
    pub host: Host,
    /// Wall-clock latency from the start of the call, not per-attempt.
    pub latency: Duration,
    /// The 1-based number of attempts made, including the successful one.
    pub attempt: u32,
    /// The operation's return value.
    pub value: R,
}
