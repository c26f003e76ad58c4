use std::fmt;

/// Identity of a backend endpoint: a (hostname, port) pair.
///
/// `Host` values are created by the caller and handed to the pool; the pool
/// never invents or resolves hosts on its own (topology discovery is out of
/// scope, see the crate's top-level documentation).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Host {
    hostname: String,
    port: u16,
}

impl Host {
    /// Construct a new host identity.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Host {
            hostname: hostname.into(),
            port,
        }
    }

    /// The hostname or IP address component.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The TCP port component.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
