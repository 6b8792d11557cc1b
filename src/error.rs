//! Resolution error types for the gateway router
//!
//! These are the only error kinds the router surfaces to request paths;
//! everything else (database failures, malformed input) is logged and
//! answered with a protocol-appropriate terminal response.

use std::fmt;

/// Errors produced while resolving a connection to an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// No routable container with the requested id
    NotFound,

    /// The container exists but has no external IP yet
    NoIp,

    /// The container exists but the requested protocol is not enabled
    /// for it (SSH disabled, or no ingress rule for the port)
    ProtocolBlocked,

    /// No static route matches the host/path pair
    NoRoute,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "container not found"),
            Self::NoIp => write!(f, "container has no external IP"),
            Self::ProtocolBlocked => write!(f, "protocol access not enabled"),
            Self::NoRoute => write!(f, "no matching route"),
        }
    }
}

impl std::error::Error for RouteError {}
