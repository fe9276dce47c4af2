//! Configuration for opening a store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::MAX_DIGEST_WIDTH;
use crate::error::{Error, Result};

/// Which mutations a store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    /// Lookups and iteration only.
    ReadOnly,
    /// Keys can be added but never overwritten or deleted one by one.
    WriteOnce,
}

/// What to do with a record written under a different format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Fail the operation with `FormatVersionMismatch`.
    Reject,
    /// Behave as if the record did not exist. Writes replace it.
    TreatAsAbsent,
}

/// Bounds on how long an operation keeps retrying under contention.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap for a single delay, before jitter
    pub max_backoff: Duration,
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Wall clock budget for all attempts and delays together
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
            max_attempts: 50,
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Never retry; the first contention failure is final.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Create the file (and its directory) when missing
    pub create_if_missing: bool,
    pub mode: AccessMode,
    /// Use the write-ahead log so readers never wait for a writer
    pub enable_wal: bool,
    /// How long the engine itself waits on a lock before reporting busy
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
    /// Bytes of SHA-256 kept as the key digest, 1..=32
    pub digest_width: usize,
    /// Refuse values that do not survive an encode/decode round trip
    pub verify_roundtrip: bool,
    pub version_policy: VersionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            create_if_missing: true,
            mode: AccessMode::ReadWrite,
            enable_wal: true,
            busy_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            digest_width: MAX_DIGEST_WIDTH,
            verify_roundtrip: false,
            version_policy: VersionPolicy::Reject,
        }
    }
}

impl StoreConfig {
    pub fn read_only() -> Self {
        StoreConfig {
            create_if_missing: false,
            mode: AccessMode::ReadOnly,
            ..StoreConfig::default()
        }
    }

    pub fn write_once() -> Self {
        StoreConfig {
            mode: AccessMode::WriteOnce,
            ..StoreConfig::default()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.digest_width == 0 || self.digest_width > MAX_DIGEST_WIDTH {
            return Err(Error::InvalidConfig(format!(
                "digest_width must be in [1, {}]",
                MAX_DIGEST_WIDTH
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be > 0".into()));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(Error::InvalidConfig(
                "retry.initial_backoff must not exceed retry.max_backoff".into(),
            ));
        }
        Ok(())
    }
}

/// File used for the store `name` kept in `container_dir`.
pub fn store_path<P: AsRef<Path>>(container_dir: P, name: &str) -> PathBuf {
    container_dir.as_ref().join(format!("{}.sqlite", name))
}
