//! Error types for store operations.
//!
//! Contention is the only failure the store retries on its own. Everything
//! else reaches the caller as soon as it happens.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::codec::{EncodedKey, KeyDigest};
use crate::config::AccessMode;
use crate::serde_interface::SerdeError;

pub type Result<T> = std::result::Result<T, Error>;

/// Which half of a record a codec failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Key,
    Value,
}

impl std::fmt::Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Part::Key => write!(f, "key"),
            Part::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode {part}: {source}")]
    Encoding {
        part: Part,
        #[source]
        source: SerdeError,
    },

    #[error("failed to decode {part}: {source}")]
    Decoding {
        part: Part,
        #[source]
        source: SerdeError,
    },

    #[error("no entry for key {key} (digest {digest})")]
    KeyNotFound { key: String, digest: KeyDigest },

    /// The store stayed locked by other writers for longer than the retry
    /// policy allows. Retrying later may succeed.
    #[error("store busy: gave up after {attempts} attempts in {elapsed:?}")]
    StoreBusy {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: rusqlite::Error,
    },

    /// The file or its schema cannot be trusted any more.
    #[error("store {path:?} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("record for key {digest} has format {found:#x}, expected {expected:#x}")]
    FormatVersionMismatch {
        digest: KeyDigest,
        found: i64,
        expected: i64,
    },

    /// The store's access mode does not allow this mutation.
    #[error("operation not allowed on a {mode:?} store")]
    ReadOnly { mode: AccessMode },

    /// A write-once store already holds a value for this key.
    #[error("entry for key {key} (digest {digest}) already exists and cannot be overwritten")]
    EntryExists { key: String, digest: KeyDigest },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage engine error: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure comes from another connection holding the lock,
    /// either directly or after the retry policy ran out.
    pub fn is_contention(&self) -> bool {
        match self {
            Error::Storage(err) => is_busy(err),
            Error::StoreBusy { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn key_not_found(key: &EncodedKey) -> Self {
        Error::KeyNotFound {
            key: key.render(),
            digest: key.digest.clone(),
        }
    }

    pub(crate) fn entry_exists(key: &EncodedKey) -> Self {
        Error::EntryExists {
            key: key.render(),
            digest: key.digest.clone(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err)
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
        }
        _ => false,
    }
}

pub(crate) fn is_corrupt(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::DatabaseCorrupt || e.code == ErrorCode::NotADatabase
        }
        _ => false,
    }
}

#[cfg(test)]
mod error_test {
    use super::*;

    fn failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_contention_classification() {
        assert!(Error::from(failure(rusqlite::ffi::SQLITE_BUSY)).is_contention());
        assert!(Error::from(failure(rusqlite::ffi::SQLITE_LOCKED)).is_contention());
        assert!(!Error::from(failure(rusqlite::ffi::SQLITE_FULL)).is_contention());
        assert!(!Error::from(failure(rusqlite::ffi::SQLITE_PERM)).is_contention());
        assert!(!Error::ReadOnly {
            mode: AccessMode::ReadOnly
        }
        .is_contention());
        assert!(Error::StoreBusy {
            attempts: 3,
            elapsed: Duration::from_millis(30),
            source: failure(rusqlite::ffi::SQLITE_BUSY),
        }
        .is_contention());
    }

    #[test]
    fn test_corrupt_classification() {
        assert!(is_corrupt(&failure(rusqlite::ffi::SQLITE_CORRUPT)));
        assert!(is_corrupt(&failure(rusqlite::ffi::SQLITE_NOTADB)));
        assert!(!is_corrupt(&failure(rusqlite::ffi::SQLITE_BUSY)));
    }
}
