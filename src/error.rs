use std::fmt;

/// Errors from balancer creation, lookup, and event handling.
#[derive(Debug)]
pub enum BalancerError {
    /// Cache or store failure while loading entities.
    Load(String),
    /// Applying a history entry to the ring failed. Fatal to creation:
    /// the registry entry is never published.
    Replay(String),
    /// No balancer is registered for the upstream and creation was disallowed.
    NotCreated(String),
    /// No checker is bound to the balancer (health posting only).
    NoHealthChecker(String),
    Internal(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::Load(msg) => write!(f, "load error: {}", msg),
            BalancerError::Replay(msg) => write!(f, "history replay failed: {}", msg),
            BalancerError::NotCreated(name) => {
                write!(f, "balancer not yet created for upstream: {}", name)
            }
            BalancerError::NoHealthChecker(name) => {
                write!(f, "no health checker found for upstream: {}", name)
            }
            BalancerError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BalancerError {}

/// Request-path errors from `execute`, carrying the HTTP status the
/// pipeline should answer with.
#[derive(Debug)]
pub enum ExecuteError {
    /// The ring had no usable peer. 503.
    NoPeersAvailable,
    /// DNS said the name does not exist. 503.
    NameResolution,
    /// Everything else. 500.
    Internal(String),
}

impl ExecuteError {
    pub fn status(&self) -> u16 {
        match self {
            ExecuteError::NoPeersAvailable | ExecuteError::NameResolution => 503,
            ExecuteError::Internal(_) => 500,
        }
    }
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::NoPeersAvailable => {
                write!(f, "failure to get a peer from the ring-balancer")
            }
            ExecuteError::NameResolution => write!(f, "name resolution failed"),
            ExecuteError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ExecuteError {}
