//! Error types for the extraction engine.

/// All errors that can cross the engine boundary.
///
/// Race-internal problems (decode failures, navigation faults, deadline
/// expiry) are folded into an [`crate::race::ExtractionOutcome`] before they
/// leave the race; only the variants below are surfaced as raw errors.
#[derive(thiserror::Error, Debug)]
pub enum MirageError {
    /// The browser backend is unreachable or its executable is missing.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A race deadline expired before any signal resolved.
    #[error("Resolution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An explicit negative signal (error page, error field).
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// A matched network body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Upstream media fetch failed.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Unknown media key or resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Too many callers already waiting for a session.
    #[error("Session pool saturated: {waiters} callers waiting")]
    PoolSaturated { waiters: usize },

    /// The pool has been torn down.
    #[error("Session pool is closed")]
    PoolClosed,

    /// Caller supplied something unusable (bad username, bad URL).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MirageError {
    /// HTTP status the boundary layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            MirageError::Timeout(_)
            | MirageError::Resolution(_)
            | MirageError::Decode(_)
            | MirageError::InvalidInput(_) => 400,
            MirageError::NotFound(_) => 404,
            MirageError::Fetch(_) => 502,
            MirageError::PoolSaturated { .. } | MirageError::PoolClosed => 503,
            MirageError::Connection(_) | MirageError::Json(_) => 500,
        }
    }

    /// Whether this is one of the "could not be resolved" outcomes.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, MirageError::Timeout(_) | MirageError::Resolution(_))
    }
}

pub type Result<T> = std::result::Result<T, MirageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_and_failure_share_status() {
        let timeout = MirageError::Timeout(Duration::from_secs(6));
        let failure = MirageError::Resolution("marker".into());
        assert_eq!(timeout.status_code(), failure.status_code());
        assert!(timeout.is_unresolved());
        assert!(failure.is_unresolved());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(MirageError::NotFound("x".into()).status_code(), 404);
        assert_eq!(MirageError::Fetch("boom".into()).status_code(), 502);
        assert_eq!(MirageError::PoolSaturated { waiters: 9 }.status_code(), 503);
        assert!(!MirageError::PoolClosed.is_unresolved());
    }
}
