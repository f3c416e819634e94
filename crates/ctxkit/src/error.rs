//! Crate error type.
//!
//! Only configuration problems and hard failures surface as [`Error`].
//! Degraded inputs (an unreadable file, a failed git probe, a summarization
//! call that times out) are logged and replaced with defaults by the
//! component that hit them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A compaction strategy name that does not exist.
    #[error("unknown compaction strategy '{0}' (expected truncate, selective, rolling_window, or llm_summary)")]
    UnknownStrategy(String),

    /// A retrieval strategy name that does not exist.
    #[error("unknown retrieval strategy '{0}' (expected dense, lexical, or hybrid)")]
    UnknownRetrieval(String),

    /// A query that cannot be searched (empty, or no searchable terms).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A summarization or embedding backend call failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// An external call exceeded its time limit.
    #[error("{0} timed out after {1} ms")]
    Timeout(&'static str, u64),

    /// A compaction strategy failed.
    #[error("compaction failed: {0}")]
    Compaction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error stems from caller-supplied configuration rather
    /// than a runtime failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_)
                | Error::UnknownStrategy(_)
                | Error::UnknownRetrieval(_)
                | Error::InvalidQuery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(Error::UnknownStrategy("fancy".into()).is_configuration());
        assert!(Error::InvalidQuery("empty".into()).is_configuration());
        assert!(!Error::Backend("503".into()).is_configuration());
        assert!(!Error::Timeout("summarization", 100).is_configuration());
    }

    #[test]
    fn messages_name_the_offending_value() {
        let e = Error::UnknownStrategy("fancy".into());
        assert!(e.to_string().contains("'fancy'"));
        let e = Error::Timeout("embedding", 250);
        assert_eq!(e.to_string(), "embedding timed out after 250 ms");
        let e = Error::Compaction("truncate grew the context".into());
        assert_eq!(e.to_string(), "compaction failed: truncate grew the context");
    }
}
