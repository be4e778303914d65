//! The error type shared by every layer of the crate.

use thiserror::Error;

/// Everything that can go wrong while batching or accessing records.
///
/// Errors are `Clone` because a single failed flush fans its error out to
/// every element that was in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The identifier was malformed, missing, or of the wrong record type.
    #[error("invalid record key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The identifier was well formed, but no record exists for it.
    #[error("no {kind} record exists with key {key}")]
    NotFound { kind: String, key: String },

    /// The record had the wrong shape or broke a field rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A batch handler broke its contract, usually by leaving an element
    /// unsettled.
    #[error("batch protocol violation: {0}")]
    Protocol(String),

    /// The backing store failed an operation or a whole round-trip.
    #[error("store failure: {0}")]
    Store(String),

    /// A controller or registry was configured incorrectly.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// True for [`Error::NotFound`]; used by the `try_*` lookups.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
