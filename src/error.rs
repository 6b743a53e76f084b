//! Error types shared across the archive engine.

use thiserror::Error;

/// Errors raised by archive operations.
///
/// Lifecycle operations translate low-level backend failures into these kinds
/// at their boundary; see the variant docs for who raises what.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input: unknown archive, invalid expression, schema
    /// violation, path escaping the archive root, duplicate basenames.
    #[error("{0}")]
    User(String),

    /// Lookup failure for a product, namespace, plugin, or export format.
    #[error("{0}")]
    NotFound(String),

    /// Catalogue uniqueness violation or invariant breach.
    #[error("{0}")]
    Integrity(String),

    /// I/O failure while putting, getting, or moving product data.
    ///
    /// `anything_stored` tells the coordinator whether files may have reached
    /// storage, which decides whether the catalogue entry can be rolled back.
    #[error("storage error: {source}")]
    Storage {
        source: Box<Error>,
        anything_stored: bool,
    },

    /// Network or credential failure while pulling a remote product.
    #[error("{0}")]
    Download(String),

    /// Stored and computed digests differ.
    #[error("{0}")]
    HashMismatch(String),

    /// Contract violation inside the engine (nested transaction, unresolved
    /// syntax tree node). Indicates a bug, not bad input.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("sqlite backend error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    /// Wrap an error raised while transferring product data.
    pub fn storage(source: Error, anything_stored: bool) -> Self {
        Error::Storage {
            source: Box::new(source),
            anything_stored,
        }
    }

    /// Unwrap a storage error to the failure that caused it, leaving other
    /// errors untouched. Coordinators surface the original failure once they
    /// have decided on catalogue rollback.
    pub fn into_storage_source(self) -> Error {
        match self {
            Error::Storage { source, .. } => *source,
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_carries_flag_and_source() {
        let err = Error::storage(Error::User("disk full".into()), true);
        match &err {
            Error::Storage {
                anything_stored, ..
            } => assert!(*anything_stored),
            _ => panic!("expected storage error"),
        }
        assert_eq!(err.to_string(), "storage error: disk full");
        match Error::storage(Error::User("disk full".into()), false).into_storage_source() {
            Error::User(message) => assert_eq!(message, "disk full"),
            _ => panic!("expected original error"),
        }
    }
}
