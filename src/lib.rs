//! A persistent dictionary that several processes can read and write at the
//! same time.
//!
//! Entries live in one SQLite file. Every operation is its own short
//! transaction, retried with backoff while other processes hold the write
//! lock, so the store can be used as a shared cache by unrelated workers:
//!
//! ```no_run
//! let cache: Store<(String, u32), Vec<f64>> = Store::open_in("cache", "spectra", StoreConfig::default())?;
//! if !cache.contains(&key)? {
//!     let result = expensive(&key);
//!     // only one of the racing workers actually inserts
//!     cache.store_if_absent(&key, &result)?;
//! }
//! let result = cache.get(&key)?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod retry;
pub mod serde_interface;
pub mod storage;
pub mod store;

pub use codec::{KeyDigest, RECORD_LAYOUT_VERSION};
pub use config::{store_path, AccessMode, RetryPolicy, StoreConfig, VersionPolicy};
pub use error::{Error, Part, Result};
pub use serde_interface::{SerdeBincode, SerdeError, SerdeInterface, SerdeJson};
pub use storage::Storage;
pub use store::{Items, Iter, Keys, Store, Values};
