//! Ownership of the on-disk store file.
//!
//! `Storage` opens the file, prepares the engine for several processes
//! sharing it (write-ahead log, bounded lock wait), makes sure the record
//! table exists and runs every unit of work in a retried transaction.
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::config::{AccessMode, RetryPolicy, StoreConfig};
use crate::error::{is_corrupt, Error, Result};
use crate::retry::with_retry;

const TABLE: &str = "records";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY,
    digest BLOB NOT NULL,
    key BLOB NOT NULL,
    value BLOB NOT NULL,
    format_version INTEGER NOT NULL,
    UNIQUE (digest, key)
)";

const COLUMNS: [&str; 5] = ["id", "digest", "key", "value", "format_version"];

/// A connection to one store file.
///
/// The handle belongs to a single thread at a time; give every thread or
/// process its own `Storage`.
pub struct Storage {
    path: PathBuf,
    conn: Connection,
    retry: RetryPolicy,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("path", &self.path).finish()
    }
}

impl Storage {
    /// Open the store at `path`, creating the file and its table when allowed.
    ///
    /// Table creation is conditional, so any number of processes may race to
    /// open a fresh path. Opening a store whose table already exists never
    /// takes the write lock, and a read-only store is opened without write
    /// access to the file at all.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = PathBuf::from(path.as_ref());
        let read_only = config.mode == AccessMode::ReadOnly;

        let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
        }
        if config.create_if_missing && !read_only {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        } else if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store file {:?} does not exist", path),
            )));
        }

        let conn = Connection::open_with_flags(&path, flags)?;
        let storage = Storage {
            path,
            conn,
            retry: config.retry.clone(),
        };
        storage
            .configure(config, read_only)
            .map_err(|e| storage.escalate(e))?;
        if !read_only {
            storage.ensure_table()?;
        }
        storage.check_columns()?;
        debug!("[open] store ready at {:?} ({:?})", storage.path, config.mode);
        Ok(storage)
    }

    fn configure(&self, config: &StoreConfig, read_only: bool) -> Result<()> {
        // the lock wait has to be in place before anything touches the file
        self.conn.busy_timeout(config.busy_timeout)?;
        if config.enable_wal && !read_only {
            let conn = &self.conn;
            let current: String = with_retry(&self.retry, || {
                Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
            })?;
            if !current.eq_ignore_ascii_case("wal") {
                let mode: String = with_retry(&self.retry, || {
                    Ok(conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?)
                })?;
                if !mode.eq_ignore_ascii_case("wal") {
                    warn!("[open] {:?} stays in journal mode {}", self.path, mode);
                }
            }
        }
        if !read_only {
            self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        self.conn.pragma_update(None, "temp_store", "MEMORY")?;
        self.conn.pragma_update(None, "cache_size", -64000)?;
        Ok(())
    }

    /// Create the record table unless it is already there. The existence
    /// check is a plain read; only a missing table costs a write lock.
    fn ensure_table(&self) -> Result<()> {
        if self.has_table()? {
            return Ok(());
        }
        self.write(|tx| {
            tx.execute_batch(SCHEMA)?;
            Ok(())
        })
    }

    fn has_table(&self) -> Result<bool> {
        let tables: i64 = self.read(|tx| {
            Ok(tx.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [TABLE],
                |row| row.get(0),
            )?)
        })?;
        Ok(tables > 0)
    }

    fn check_columns(&self) -> Result<()> {
        let names: Vec<String> = self.read(|tx| {
            let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", TABLE))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })?;
        if names.is_empty() {
            return Err(Error::StoreCorrupt {
                path: self.path.clone(),
                reason: format!("table {} is missing", TABLE),
            });
        }
        for column in COLUMNS.iter() {
            if !names.iter().any(|n| n == column) {
                return Err(Error::StoreCorrupt {
                    path: self.path.clone(),
                    reason: format!("table {} has no column {}", TABLE, column),
                });
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` in a write transaction. The write lock is taken when the
    /// transaction begins, so contention shows up there and is retried.
    pub fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        self.transact(TransactionBehavior::Immediate, op)
    }

    /// Run `op` in a read transaction, which sees one consistent snapshot.
    pub fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        self.transact(TransactionBehavior::Deferred, op)
    }

    fn transact<T, F>(&self, behavior: TransactionBehavior, mut op: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        let conn = &self.conn;
        with_retry(&self.retry, || {
            // dropping an uncommitted transaction rolls it back
            let tx = Transaction::new_unchecked(conn, behavior)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .map_err(|e| self.escalate(e))
    }

    /// Bytes allocated by the store file, free pages included.
    pub fn size_on_disk(&self) -> Result<u64> {
        let size: i64 = self.read(|tx| {
            Ok(tx.query_row(
                "SELECT page_size * page_count FROM pragma_page_size(), pragma_page_count()",
                [],
                |row| row.get(0),
            )?)
        })?;
        Ok(size as u64)
    }

    /// Rebuild the file to give free pages back to the filesystem.
    pub fn vacuum(&self) -> Result<()> {
        let conn = &self.conn;
        with_retry(&self.retry, || Ok(conn.execute_batch("VACUUM")?)).map_err(|e| self.escalate(e))
    }

    /// Release the handle. Consuming `self` makes further use impossible.
    pub fn close(self) -> Result<()> {
        debug!("[close] {:?}", self.path);
        let path = self.path;
        self.conn.close().map_err(|(_, e)| {
            if is_corrupt(&e) {
                Error::StoreCorrupt {
                    path,
                    reason: e.to_string(),
                }
            } else {
                Error::Storage(e)
            }
        })
    }

    fn escalate(&self, err: Error) -> Error {
        match err {
            Error::Storage(e) if is_corrupt(&e) => Error::StoreCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod storage_test {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile;

    fn fast_busy() -> StoreConfig {
        StoreConfig {
            busy_timeout: Duration::from_millis(20),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
                max_attempts: 5,
                max_elapsed: Duration::from_millis(500),
            },
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_storage_creates_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");
        let storage = Storage::open(&path, &StoreConfig::default()).unwrap();
        assert!(path.exists());
        let mode: String = storage
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!("wal", mode.to_lowercase());
        assert!(storage.size_on_disk().unwrap() > 0);
        storage.close().unwrap();
    }

    #[test]
    fn test_storage_require_existing() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..StoreConfig::default()
        };
        let path = dir.path().join("missing.sqlite");
        assert!(matches!(Storage::open(&path, &config), Err(Error::Io(_))));
        assert!(!path.exists());

        Storage::open(&path, &StoreConfig::default()).unwrap();
        Storage::open(&path, &config).unwrap();
    }

    #[test]
    fn test_storage_schema_race() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.sqlite");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || Storage::open(path, &StoreConfig::default()).map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        let storage = Storage::open(&path, &StoreConfig::default()).unwrap();
        let tables: i64 = storage
            .read(|tx| {
                Ok(tx.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'records'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(1, tables);
    }

    #[test]
    fn test_storage_rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.sqlite");
        std::fs::write(&path, vec![0x5a; 8192]).unwrap();
        match Storage::open(&path, &StoreConfig::default()) {
            Err(Error::StoreCorrupt { .. }) => {}
            other => panic!("expected StoreCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_storage_rejects_foreign_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE records (keyhash TEXT PRIMARY KEY, key_value BLOB)")
            .unwrap();
        drop(conn);
        match Storage::open(&path, &StoreConfig::default()) {
            Err(Error::StoreCorrupt { reason, .. }) => assert!(reason.contains("has no column")),
            other => panic!("expected StoreCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_storage_busy_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.sqlite");
        let storage = Storage::open(&path, &fast_busy()).unwrap();

        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let start = Instant::now();
        let result = storage.write(|tx| {
            tx.execute("DELETE FROM records", [])?;
            Ok(())
        });
        match result {
            Err(Error::StoreBusy { attempts, .. }) => assert!(attempts >= 1),
            other => panic!("expected StoreBusy, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));

        holder.execute_batch("COMMIT").unwrap();
        storage
            .write(|tx| {
                tx.execute("DELETE FROM records", [])?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_storage_open_skips_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.sqlite");
        let storage = Storage::open(&path, &StoreConfig::default()).unwrap();

        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let impatient = StoreConfig {
            busy_timeout: Duration::from_millis(10),
            retry: RetryPolicy::no_retry(),
            ..StoreConfig::default()
        };
        let reader = Storage::open(
            &path,
            &StoreConfig {
                mode: AccessMode::ReadOnly,
                create_if_missing: false,
                ..impatient.clone()
            },
        )
        .unwrap();
        Storage::open(&path, &impatient).unwrap();

        // the read-only handle cannot write even once the lock is free
        holder.execute_batch("COMMIT").unwrap();
        assert!(reader
            .write(|tx| {
                tx.execute("DELETE FROM records", [])?;
                Ok(())
            })
            .is_err());
        storage
            .write(|tx| {
                tx.execute("DELETE FROM records", [])?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_storage_read_only_needs_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE other (x INTEGER)").unwrap();
        drop(conn);
        match Storage::open(&path, &StoreConfig::read_only()) {
            Err(Error::StoreCorrupt { reason, .. }) => assert!(reason.contains("is missing")),
            other => panic!("expected StoreCorrupt, got {:?}", other),
        }
        // a writable open creates it
        Storage::open(&path, &StoreConfig::default()).unwrap();
        Storage::open(&path, &StoreConfig::read_only()).unwrap();
    }

    #[test]
    fn test_storage_waits_for_short_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wait.sqlite");
        let config = StoreConfig {
            retry: RetryPolicy {
                max_attempts: 1000,
                max_elapsed: Duration::from_secs(10),
                ..fast_busy().retry
            },
            ..fast_busy()
        };
        let storage = Storage::open(&path, &config).unwrap();

        let holder_path = path.clone();
        let (tx_ready, rx_ready) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let holder = Connection::open(holder_path).unwrap();
            holder.execute_batch("BEGIN IMMEDIATE").unwrap();
            tx_ready.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
            holder.execute_batch("COMMIT").unwrap();
        });
        rx_ready.recv().unwrap();

        let start = Instant::now();
        storage
            .write(|tx| {
                tx.execute("DELETE FROM records", [])?;
                Ok(())
            })
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        handle.join().unwrap();
    }
}
