//! Error taxonomy for the instancer.
//!
//! Structural failures (hostname conflicts, invalid transitions) surface to
//! callers as typed variants; transient runtime/proxy failures are retried
//! locally with backoff and only reach callers when retries are exhausted.

use crate::instance::InstanceState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstancerError {
    /// Two instances would claim the same route. Recoverable: the caller
    /// must pick a different owner/slug or wait for the holder to expire.
    #[error("hostname {hostname} is already routed for instance {holder}")]
    HostnameConflict { hostname: String, holder: String },

    /// Requested state edge is not in the allowed graph. Ordering bug.
    #[error("invalid transition {from} -> {to} for instance {instance_id}")]
    InvalidTransition {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },

    /// Proxy config validation or reload failed. The triggering record has
    /// been rolled back; previously published records are untouched.
    #[error("proxy reload failed: {0}")]
    ProxyReloadFailed(String),

    /// Container runtime unreachable or returned a transport-level error.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Terminal upgrade attempted against a non-running instance.
    #[error("terminal session rejected: {0}")]
    SessionRejected(String),

    /// One-active-instance-per-owner invariant would be violated.
    #[error("owner {owner_id} already has active instance {instance_id} for challenge {challenge_id}")]
    AlreadyActive {
        challenge_id: String,
        owner_id: String,
        instance_id: String,
    },

    /// Registry purge attempted while the route is still enabled.
    #[error("route for {hostname} is still enabled; retract it first")]
    RouteActive { hostname: String },

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("unknown hostname {0}")]
    UnknownHostname(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("invalid challenge spec: {0}")]
    InvalidChallengeSpec(String),

    #[error("registry storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InstancerError>;

impl InstancerError {
    /// Transient errors are retried with backoff and never propagate to the
    /// end user directly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstancerError::RuntimeUnavailable(_) | InstancerError::ProxyReloadFailed(_)
        )
    }
}
