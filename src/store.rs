use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use log::debug;
use rusqlite::{params, Transaction};
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{Codec, EncodedKey, KeyDigest};
use crate::config::{store_path, AccessMode, StoreConfig, VersionPolicy};
use crate::error::{Error, Result};
use crate::serde_interface::{SerdeBincode, SerdeInterface, SerdeJson};
use crate::storage::Storage;

/// Rows fetched per round trip while iterating.
const PAGE_SIZE: i64 = 256;

/// A persistent dictionary shared by every process that opens the same file.
///
/// Each call is one self-contained transaction: there is no begin/commit for
/// the caller, and a value is only ever replaced wholesale.
///
/// `KS` serializes keys and must be canonical; `VS` serializes values.
pub struct Store<K, V, KS = SerdeJson, VS = SerdeBincode> {
    storage: Storage,
    codec: Codec<KS, VS>,
    mode: AccessMode,
    version_policy: VersionPolicy,
    entry: PhantomData<fn() -> (K, V)>,
}

/// What a digest lookup found for one exact key.
struct Found {
    id: i64,
    format_version: i64,
    value: Option<Vec<u8>>,
}

impl<K, V, KS, VS> fmt::Debug for Store<K, V, KS, VS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.storage.path())
            .field("mode", &self.mode)
            .finish()
    }
}

impl<K, V, KS, VS> Store<K, V, KS, VS>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    KS: SerdeInterface,
    VS: SerdeInterface,
{
    /// Open or create a read-write store at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let storage = Storage::open(path, &config)?;
        Ok(Store {
            storage,
            codec: Codec::new(config.digest_width, config.verify_roundtrip),
            mode: config.mode,
            version_policy: config.version_policy,
            entry: PhantomData,
        })
    }

    /// Open the store called `name` inside `container_dir`.
    pub fn open_in<P: AsRef<Path>>(container_dir: P, name: &str, config: StoreConfig) -> Result<Self> {
        Self::open_with(store_path(container_dir, name), config)
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Get value by key.
    pub fn get(&self, key: &K) -> Result<V> {
        let key = self.codec.encode_key(key)?;
        debug!("[get] Begin with {}", key.digest);
        let blob = self.storage.read(|tx| {
            match self.lookup(tx, &key, true)? {
                Some(found) if self.is_current(&key.digest, found.format_version)? => {
                    Ok(found.value)
                }
                _ => Ok(None),
            }
        })?;
        match blob {
            Some(blob) => self.codec.decode_value(&blob),
            None => Err(Error::key_not_found(&key)),
        }
    }

    /// Whether a record exists for `key`. The value is not read.
    pub fn contains(&self, key: &K) -> Result<bool> {
        let key = self.codec.encode_key(key)?;
        self.storage.read(|tx| match self.lookup(tx, &key, false)? {
            Some(found) => self.is_current(&key.digest, found.format_version),
            None => Ok(false),
        })
    }

    /// Insert `key`, replacing any previous value.
    ///
    /// A write-once store refuses keys that already hold a value. A record
    /// written in another format is only replaced under
    /// `VersionPolicy::TreatAsAbsent`; otherwise it is left untouched and the
    /// call fails with `FormatVersionMismatch`.
    pub fn set(&self, key: &K, value: &V) -> Result<()> {
        self.check_writable()?;
        let key = self.codec.encode_key(key)?;
        let value = self.codec.encode_value(value)?;
        debug!("[set] Begin with {} ({} bytes)", key.digest, value.len());
        if self.mode == AccessMode::WriteOnce {
            return if self.insert_if_absent(&key, &value)? {
                Ok(())
            } else {
                Err(Error::entry_exists(&key))
            };
        }
        let format_version = self.codec.format_version();
        self.storage.write(|tx| {
            match self.lookup(tx, &key, false)? {
                Some(found) => {
                    if !self.is_current(&key.digest, found.format_version)? {
                        debug!("[set] replacing stale record {}", key.digest);
                    }
                    tx.prepare_cached("UPDATE records SET value = ?1, format_version = ?2 WHERE id = ?3")?
                        .execute(params![value, format_version, found.id])?;
                }
                None => {
                    tx.prepare_cached(
                        "INSERT INTO records (digest, key, value, format_version)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?
                    .execute(params![key.digest.as_bytes(), key.blob, value, format_version])?;
                }
            }
            Ok(())
        })
    }

    /// Insert `key` only if it has no record yet and report whether this call
    /// inserted it.
    ///
    /// Check and insert happen under one write lock, so of several processes
    /// racing on the same key exactly one gets `true`.
    pub fn store_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        self.check_writable()?;
        let key = self.codec.encode_key(key)?;
        let value = self.codec.encode_value(value)?;
        self.insert_if_absent(&key, &value)
    }

    fn insert_if_absent(&self, key: &EncodedKey, value: &[u8]) -> Result<bool> {
        let format_version = self.codec.format_version();
        let inserted = self.storage.write(|tx| {
            match self.lookup(tx, key, false)? {
                Some(found) if self.is_current(&key.digest, found.format_version)? => Ok(false),
                Some(stale) => {
                    debug!("[store_if_absent] replacing stale record {}", key.digest);
                    tx.execute(
                        "UPDATE records SET value = ?1, format_version = ?2 WHERE id = ?3",
                        params![value, format_version, stale.id],
                    )?;
                    Ok(true)
                }
                None => {
                    tx.prepare_cached(
                        "INSERT INTO records (digest, key, value, format_version)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?
                    .execute(params![key.digest.as_bytes(), key.blob, value, format_version])?;
                    Ok(true)
                }
            }
        })?;
        debug!("[store_if_absent] {} inserted: {}", key.digest, inserted);
        Ok(inserted)
    }

    /// Remove the record for `key`.
    ///
    /// A missing key is reported as `KeyNotFound`; the store is left as it
    /// was, so repeating a delete changes nothing.
    pub fn delete(&self, key: &K) -> Result<()> {
        if self.mode != AccessMode::ReadWrite {
            return Err(Error::ReadOnly { mode: self.mode });
        }
        let key = self.codec.encode_key(key)?;
        debug!("[delete] Begin with {}", key.digest);
        let deleted = self.storage.write(|tx| match self.lookup(tx, &key, false)? {
            Some(found) if self.is_current(&key.digest, found.format_version)? => {
                tx.execute("DELETE FROM records WHERE id = ?1", params![found.id])?;
                Ok(true)
            }
            _ => Ok(false),
        })?;
        if deleted {
            Ok(())
        } else {
            Err(Error::key_not_found(&key))
        }
    }

    /// Number of committed records.
    ///
    /// Under `VersionPolicy::TreatAsAbsent` records in another format are
    /// not counted, matching what `contains` and `keys` report. Under
    /// `Reject` every record counts.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.storage.read(|tx| {
            Ok(match self.version_policy {
                VersionPolicy::Reject => {
                    tx.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?
                }
                VersionPolicy::TreatAsAbsent => tx.query_row(
                    "SELECT COUNT(*) FROM records WHERE format_version = ?1",
                    params![self.codec.format_version()],
                    |row| row.get(0),
                )?,
            })
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every record in a single transaction.
    pub fn clear(&self) -> Result<()> {
        self.check_writable()?;
        let removed = self
            .storage
            .write(|tx| Ok(tx.execute("DELETE FROM records", [])?))?;
        debug!("[clear] removed {} records", removed);
        Ok(())
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Keys<'_, K, V, KS, VS> {
        Iter::new(self, false, |store, row| store.codec.decode_key(&row.key))
    }

    /// Values in insertion order.
    pub fn values(&self) -> Values<'_, K, V, KS, VS> {
        Iter::new(self, true, |store, row| store.codec.decode_value(&row.value))
    }

    /// Key/value pairs in insertion order.
    pub fn items(&self) -> Items<'_, K, V, KS, VS> {
        Iter::new(self, true, |store, row| {
            Ok((
                store.codec.decode_key(&row.key)?,
                store.codec.decode_value(&row.value)?,
            ))
        })
    }

    pub fn size_on_disk(&self) -> Result<u64> {
        self.storage.size_on_disk()
    }

    pub fn vacuum(&self) -> Result<()> {
        self.check_writable()?;
        self.storage.vacuum()
    }

    pub fn close(self) -> Result<()> {
        self.storage.close()
    }

    fn check_writable(&self) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(Error::ReadOnly { mode: self.mode });
        }
        Ok(())
    }

    /// Find the record whose full key equals `key` among those sharing its
    /// digest.
    fn lookup(&self, tx: &Transaction, key: &EncodedKey, with_value: bool) -> Result<Option<Found>> {
        let mut stmt = tx.prepare_cached(
            "SELECT id, key, format_version, CASE WHEN ?2 THEN value ELSE NULL END
             FROM records WHERE digest = ?1",
        )?;
        let mut rows = stmt.query(params![key.digest.as_bytes(), with_value])?;
        let mut found = None;
        let mut others = 0;
        while let Some(row) = rows.next()? {
            let stored: Vec<u8> = row.get(1)?;
            if stored == key.blob {
                found = Some(Found {
                    id: row.get(0)?,
                    format_version: row.get(2)?,
                    value: row.get(3)?,
                });
            } else {
                others += 1;
            }
        }
        if others > 0 {
            debug!("[lookup] {} other key(s) share digest {}", others, key.digest);
        }
        Ok(found)
    }

    /// Whether a record with `found` format tag may be decoded. Under
    /// `TreatAsAbsent` a foreign record reads as missing.
    fn is_current(&self, digest: &KeyDigest, found: i64) -> Result<bool> {
        let expected = self.codec.format_version();
        if found == expected {
            return Ok(true);
        }
        match self.version_policy {
            VersionPolicy::Reject => Err(Error::FormatVersionMismatch {
                digest: digest.clone(),
                found,
                expected,
            }),
            VersionPolicy::TreatAsAbsent => Ok(false),
        }
    }
}

/// One raw record as read during iteration.
pub struct Row {
    id: i64,
    digest: KeyDigest,
    key: Vec<u8>,
    value: Vec<u8>,
    format_version: i64,
}

/// Lazy iteration over a store.
///
/// Records are fetched a page at a time in insertion order and no
/// transaction stays open between pages. Concurrent writers are not blocked:
/// every record present for the whole iteration is yielded exactly once,
/// records added or removed meanwhile may or may not be.
pub struct Iter<'s, K, V, KS, VS, T> {
    store: &'s Store<K, V, KS, VS>,
    with_values: bool,
    after: i64,
    page: VecDeque<Row>,
    exhausted: bool,
    extract: fn(&Store<K, V, KS, VS>, Row) -> Result<T>,
}

pub type Keys<'s, K, V, KS, VS> = Iter<'s, K, V, KS, VS, K>;
pub type Values<'s, K, V, KS, VS> = Iter<'s, K, V, KS, VS, V>;
pub type Items<'s, K, V, KS, VS> = Iter<'s, K, V, KS, VS, (K, V)>;

impl<'s, K, V, KS, VS, T> Iter<'s, K, V, KS, VS, T>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    KS: SerdeInterface,
    VS: SerdeInterface,
{
    fn new(
        store: &'s Store<K, V, KS, VS>,
        with_values: bool,
        extract: fn(&Store<K, V, KS, VS>, Row) -> Result<T>,
    ) -> Self {
        Iter {
            store,
            with_values,
            after: 0,
            page: VecDeque::new(),
            exhausted: false,
            extract,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let (after, with_values) = (self.after, self.with_values);
        let rows = self.store.storage.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT id, digest, key, CASE WHEN ?3 THEN value ELSE X'' END, format_version
                 FROM records WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![after, PAGE_SIZE, with_values], |row| {
                    Ok(Row {
                        id: row.get(0)?,
                        digest: KeyDigest::from(row.get::<_, Vec<u8>>(1)?),
                        key: row.get(2)?,
                        value: row.get(3)?,
                        format_version: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<VecDeque<_>>>()?;
            Ok(rows)
        })?;
        if (rows.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.back() {
            self.after = last.id;
        }
        self.page = rows;
        Ok(())
    }
}

impl<'s, K, V, KS, VS, T> Iterator for Iter<'s, K, V, KS, VS, T>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    KS: SerdeInterface,
    VS: SerdeInterface,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page.is_empty() {
                if self.exhausted {
                    return None;
                }
                if let Err(e) = self.fetch_page() {
                    self.exhausted = true;
                    return Some(Err(e));
                }
                continue;
            }
            let row = self.page.pop_front()?;
            match self.store.is_current(&row.digest, row.format_version) {
                Ok(true) => return Some((self.extract)(self.store, row)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
