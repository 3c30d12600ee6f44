//! Error types shared across crates
//!
//! Every crate defines its own error enum and converts into [`Error`] at the
//! boundary where an HTTP status or a stream event has to be chosen.

use thiserror::Error;

/// Top-level error, one variant per externally visible failure class.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: bad session-id shape, missing fields, out-of-range
    /// values. Never enqueued, surfaced as HTTP 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing session, persona, or API profile. HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Owner mismatch. HTTP 403; the message must not reveal whether the
    /// entity exists.
    #[error("permission denied")]
    PermissionDenied,

    /// Undecryptable key, missing embedder, or other misconfiguration.
    /// HTTP 500 on management calls, `agent.error` during turns.
    #[error("configuration error: {0}")]
    Config(String),

    /// LLM, embedding, or vector-store failure. Recovered per persona.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An LLM call exceeded its wall-clock deadline.
    #[error("timeout")]
    Timeout,

    /// Session deleted or process shutting down while a turn was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected invariant violation. HTTP 500, internals not exposed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the failure should be reported as `agent.error` on the
    /// stream and the turn should continue with the next persona.
    pub fn is_recoverable_in_turn(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::Timeout | Error::Config(_)
        )
    }
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Timeout.is_recoverable_in_turn());
        assert!(Error::Upstream("503".into()).is_recoverable_in_turn());
        assert!(!Error::Cancelled.is_recoverable_in_turn());
        assert!(!Error::PermissionDenied.is_recoverable_in_turn());
    }

    #[test]
    fn test_permission_denied_reveals_nothing() {
        let msg = Error::PermissionDenied.to_string();
        assert_eq!(msg, "permission denied");
    }
}
