//! The crate-wide error type.
//!
//! Grounded in the `Error`/`ErrorKind` split used by `mongodb`'s driver
//! (`examples/mongodb-mongo-rust-driver/src/error.rs`): a small `Clone`-able
//! `Error` wraps an `Arc<ErrorKind>` so the same failure can be reported to
//! both the caller and the `Monitor`/health tracker without re-deriving its
//! classification.

use std::fmt;
use std::sync::Arc;

use thiserror::Error as ThisError;

use crate::host::Host;

/// A boxed, type-erased source error from user code or a `ManageConnection`
/// implementor.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The crate's error type.
///
/// Cloning an `Error` is cheap; the underlying [`ErrorKind`] is
/// reference-counted rather than duplicated.
#[derive(Clone, Debug)]
pub struct Error {
    kind: Arc<ErrorKind>,
}

impl Error {
    /// Wrap an [`ErrorKind`].
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind: Arc::new(kind),
        }
    }

    /// The classified kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// True if this error should never be retried by a [`crate::RetryPolicy`]
    /// regardless of what the policy says (spec: `NoAvailableHosts` is never
    /// retried because there is nowhere left to go).
    pub fn is_terminal(&self) -> bool {
        matches!(&*self.kind, ErrorKind::NoAvailableHosts | ErrorKind::Unexpected(_))
    }

    /// True if this error should be fed into the per-host error-rate
    /// monitor. Only fatal connection errors count toward eviction; transient
    /// and throttled errors do not.
    pub fn is_fatal_connection(&self) -> bool {
        matches!(&*self.kind, ErrorKind::FatalConnection { .. })
    }

    pub(crate) fn no_available_hosts() -> Self {
        Error::new(ErrorKind::NoAvailableHosts)
    }

    pub(crate) fn pool_exhausted(host: Host) -> Self {
        Error::new(ErrorKind::PoolExhausted { host })
    }

    pub(crate) fn pool_offline(host: Host) -> Self {
        Error::new(ErrorKind::PoolOffline { host })
    }

    pub(crate) fn fatal_connection(host: Host, source: BoxError) -> Self {
        Error::new(ErrorKind::FatalConnection { host, source })
    }

    pub(crate) fn transient(host: Option<Host>, source: BoxError) -> Self {
        Error::new(ErrorKind::Transient { host, source })
    }

    /// Build a [`ErrorKind::FatalConnection`] error. For use by `Operation`
    /// implementors that detect, from the result of their own I/O, that the
    /// connection they were handed must be discarded.
    pub fn fatal(host: Host, source: impl Into<BoxError>) -> Self {
        Error::fatal_connection(host, source.into())
    }

    /// Build a [`ErrorKind::Transient`] error. For use by `Operation`
    /// implementors reporting a generic, retryable failure that should not
    /// count toward host eviction.
    pub fn transient_for(host: Option<Host>, source: impl Into<BoxError>) -> Self {
        Error::transient(host, source.into())
    }

    /// Wrap an arbitrary, non-domain error surfaced from user code.
    pub fn unexpected(message: impl fmt::Display) -> Self {
        Error::new(ErrorKind::Unexpected(message.to_string()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.kind)
    }
}

/// The set of error kinds the pool can surface.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Zero active host pools. Terminal; never retried.
    #[error("no available hosts")]
    NoAvailableHosts,

    /// All host pools tried refused to hand out a connection within the
    /// timeout. Subject to the retry policy.
    #[error("connection pool exhausted for host {host}")]
    PoolExhausted {
        /// The host whose sub-pool was exhausted.
        host: Host,
    },

    /// The sub-pool for `host` is not `Active` (still priming, or
    /// shutting down). Subject to the retry policy.
    #[error("connection pool offline for host {host}")]
    PoolOffline {
        /// The host whose sub-pool is offline.
        host: Host,
    },

    /// The connection must be discarded. Feeds the error-rate monitor and
    /// may trigger host eviction.
    #[error("fatal connection error on host {host}: {source}")]
    FatalConnection {
        /// The host the failing connection belonged to.
        host: Host,
        /// The underlying error reported by user code or the manager.
        #[source]
        source: BoxError,
    },

    /// A generic, retryable failure. Does not count toward eviction.
    #[error("transient error: {source}")]
    Transient {
        /// The host that produced the error, if one had been selected yet.
        host: Option<Host>,
        /// The underlying error.
        #[source]
        source: BoxError,
    },

    /// A non-domain failure from user code, wrapped and surfaced as-is.
    /// Never retried.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
