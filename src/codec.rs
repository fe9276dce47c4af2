//! Translation between caller keys/values and the bytes kept in a record.

use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Part, Result};
use crate::serde_interface::{SerdeError, SerdeInterface};

/// Bumped whenever the meaning of the record columns changes.
pub const RECORD_LAYOUT_VERSION: i64 = 1;

/// Widest digest we can produce, the full SHA-256 output.
pub const MAX_DIGEST_WIDTH: usize = 32;

/// Fixed-width hash of an encoded key. Used as the lookup index; equality of
/// the full key bytes decides the match.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyDigest(Vec<u8>);

impl KeyDigest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for KeyDigest {
    fn from(bytes: Vec<u8>) -> Self {
        KeyDigest(bytes)
    }
}

impl fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({})", self)
    }
}

/// A key in its persisted form.
#[derive(Debug, Clone)]
pub struct EncodedKey {
    pub digest: KeyDigest,
    pub blob: Vec<u8>,
}

impl EncodedKey {
    /// Readable form of the key for error messages: the text for textual
    /// formats, hex otherwise.
    pub fn render(&self) -> String {
        match std::str::from_utf8(&self.blob) {
            Ok(text) => text.to_owned(),
            Err(_) => KeyDigest(self.blob.clone()).to_string(),
        }
    }
}

/// Encodes and decodes one store's keys with `KS` and values with `VS`.
///
/// `KS` must be deterministic: equal keys give equal bytes in every process.
pub struct Codec<KS, VS> {
    digest_width: usize,
    verify_roundtrip: bool,
    format: PhantomData<(KS, VS)>,
}

impl<KS, VS> Codec<KS, VS>
where
    KS: SerdeInterface,
    VS: SerdeInterface,
{
    pub fn new(digest_width: usize, verify_roundtrip: bool) -> Self {
        Codec {
            digest_width: digest_width.clamp(1, MAX_DIGEST_WIDTH),
            verify_roundtrip,
            format: PhantomData,
        }
    }

    /// Tag stored with every record this codec writes.
    pub fn format_version(&self) -> i64 {
        (RECORD_LAYOUT_VERSION << 16) | ((KS::FORMAT_ID as i64) << 8) | VS::FORMAT_ID as i64
    }

    pub fn digest(&self, blob: &[u8]) -> KeyDigest {
        let full = Sha256::digest(blob);
        KeyDigest(full[..self.digest_width].to_vec())
    }

    pub fn encode_key<K: Serialize>(&self, key: &K) -> Result<EncodedKey> {
        let blob = KS::to_vec(key).map_err(|source| Error::Encoding {
            part: Part::Key,
            source,
        })?;
        let digest = self.digest(&blob);
        Ok(EncodedKey { digest, blob })
    }

    pub fn decode_key<K: DeserializeOwned>(&self, blob: &[u8]) -> Result<K> {
        KS::from_slice(blob).map_err(|source| Error::Decoding {
            part: Part::Key,
            source,
        })
    }

    /// Encodes `value`. With `verify_roundtrip` set, the bytes are decoded and
    /// encoded again, and the value is refused unless both encodings agree.
    pub fn encode_value<V>(&self, value: &V) -> Result<Vec<u8>>
    where
        V: Serialize + DeserializeOwned,
    {
        let encoding = |source| Error::Encoding {
            part: Part::Value,
            source,
        };
        let blob = VS::to_vec(value).map_err(encoding)?;
        if self.verify_roundtrip {
            let decoded: V = VS::from_slice(&blob).map_err(encoding)?;
            if VS::to_vec(&decoded).map_err(encoding)? != blob {
                return Err(encoding(SerdeError::Unstable));
            }
        }
        Ok(blob)
    }

    pub fn decode_value<V: DeserializeOwned>(&self, blob: &[u8]) -> Result<V> {
        VS::from_slice(blob).map_err(|source| Error::Decoding {
            part: Part::Value,
            source,
        })
    }
}
