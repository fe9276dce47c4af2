//! Choose one way to serialize and deserialize your keys and values.
//!
//! Now there are two ways available:
//! - json, canonical: object keys are always emitted in sorted order
//! - bincode, compact but not canonical for hash-ordered maps
//!
//! # Examples
//!
//! Pick the format through a type parameter, the store only ever sees it as
//! `PhantomData`.
//! ```no_run
//! let store: Store<String, Vec<u8>, SerdeJson, SerdeBincode> = Store::open(path)?;
//! ```
//!
//! Keys are hashed from their encoded bytes, so a key format must produce the
//! same bytes for equal keys in every process. `SerdeJson` takes care of maps;
//! sets should be given as `BTreeSet`, because a `HashSet` serializes in its
//! random iteration order and no serializer can tell it apart from a sequence.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Failure raised by a `SerdeInterface` implementation.
#[derive(Debug, Error)]
pub enum SerdeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    /// Decoding the encoded bytes and encoding again gave different bytes.
    #[error("value does not survive an encode/decode round trip")]
    Unstable,
}

/// Uniform interface for serde::Serializer and serde::Deserializer implementations
pub trait SerdeInterface {
    /// Tag persisted with every record so that rows written by another format
    /// are never decoded with this one.
    const FORMAT_ID: u8;

    fn from_slice<T>(bytes: &[u8]) -> Result<T, SerdeError>
    where
        T: DeserializeOwned;
    fn to_vec<T>(value: &T) -> Result<Vec<u8>, SerdeError>
    where
        T: Serialize;
}

/// Json interface. Goes through `serde_json::Value`, whose maps are ordered,
/// so the output does not depend on the iteration order of the input.
///
/// This Sturct has no fields, you can use it as PhantomData
#[derive(Debug)]
pub struct SerdeJson;

impl SerdeInterface for SerdeJson {
    const FORMAT_ID: u8 = 1;

    fn from_slice<T>(bytes: &[u8]) -> Result<T, SerdeError>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_slice(bytes)?)
    }
    fn to_vec<T>(value: &T) -> Result<Vec<u8>, SerdeError>
    where
        T: Serialize,
    {
        let canonical = serde_json::to_value(value)?;
        Ok(serde_json::to_vec(&canonical)?)
    }
}

/// Bincode interface.
///
/// This Sturct has no fields, you can use it as PhantomData
#[derive(Debug)]
pub struct SerdeBincode;

impl SerdeInterface for SerdeBincode {
    const FORMAT_ID: u8 = 2;

    fn from_slice<T>(bytes: &[u8]) -> Result<T, SerdeError>
    where
        T: DeserializeOwned,
    {
        Ok(bincode::deserialize(bytes)?)
    }
    fn to_vec<T>(value: &T) -> Result<Vec<u8>, SerdeError>
    where
        T: Serialize,
    {
        Ok(bincode::serialize(value)?)
    }
}

#[cfg(test)]
mod serde_test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_json_sorts_map_keys() {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        for i in 0..64 {
            forward.insert(format!("k{}", i), i);
        }
        for i in (0..64).rev() {
            backward.insert(format!("k{}", i), i);
        }
        assert_eq!(
            SerdeJson::to_vec(&forward).unwrap(),
            SerdeJson::to_vec(&backward).unwrap()
        );
    }

    #[test]
    fn test_bincode_tuple() {
        let key = (42i64, "answer".to_owned(), Some(1.5f64));
        let bytes = SerdeBincode::to_vec(&key).unwrap();
        let back: (i64, String, Option<f64>) = SerdeBincode::from_slice(&bytes).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn test_malformed_input() {
        assert!(SerdeJson::from_slice::<u32>(b"{not json").is_err());
        assert!(SerdeBincode::from_slice::<String>(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_format_ids_differ() {
        assert_ne!(SerdeJson::FORMAT_ID, SerdeBincode::FORMAT_ID);
    }
}
