//! Canonical serialization and content hashing of structured input.
//!
//! The canonical form is JSON text in which every map is written with its entries sorted by key,
//! while list order is kept as is. Two payloads that only differ in map insertion order therefore
//! produce the same text and the same [`ContentHash`].

use std::fmt::{self, Write};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::CacheError;

/// A hex-formatted sha-256 digest of the canonical form of some value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of the hex representation.
    pub const LEN: usize = 64;

    /// Hashes an already canonicalized string.
    pub fn of_canonical(canonical: &str) -> Self {
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Brings `value` into its canonical textual form.
///
/// Fails with [`CacheError::UnsupportedValue`] if `value` cannot be represented as a JSON-like
/// value, for example a map with non-string keys or a type whose `Serialize` implementation
/// refuses to serialize.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<String, CacheError> {
    let value =
        serde_json::to_value(value).map_err(|e| CacheError::UnsupportedValue(e.to_string()))?;

    let mut canonical = String::new();
    write_canonical(&mut canonical, &value).map_err(CacheError::from_std_error)?;
    Ok(canonical)
}

/// Computes the [`ContentHash`] of the canonical form of `value`.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, CacheError> {
    canonicalize(value).map(|canonical| ContentHash::of_canonical(&canonical))
}

fn write_canonical<W: Write>(out: &mut W, value: &Value) -> fmt::Result {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            write!(out, "{value}")
        }
        Value::Array(items) => {
            out.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write_canonical(out, item)?;
            }
            out.write_char(']')
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.write_char('{')?;
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                let key = serde_json::to_string(key).map_err(|_| fmt::Error)?;
                out.write_str(&key)?;
                out.write_char(':')?;
                write_canonical(out, item)?;
            }
            out.write_char('}')
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::Serializer;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_canonical_form() {
        let value = json!({
            "symbol": "SOL",
            "window": [3, 1, 2],
            "filters": {"venue": "dex", "chain": "solana", "min_liquidity": 1.5},
            "verbose": false,
            "cursor": null,
        });

        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"cursor":null,"filters":{"chain":"solana","min_liquidity":1.5,"venue":"dex"},"symbol":"SOL","verbose":false,"window":[3,1,2]}"#
        );
    }

    #[test]
    fn test_map_order_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"b": {"y": 1, "x": [1, {"q": 1, "p": 2}]}, "a": "z"}"#)
            .unwrap();
        let b: Value = serde_json::from_str(r#"{"a": "z", "b": {"x": [1, {"p": 2, "q": 1}], "y": 1}}"#)
            .unwrap();

        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_list_order_is_significant() {
        let a = json!({"assets": ["BTC", "ETH"]});
        let b = json!({"assets": ["ETH", "BTC"]});

        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_structs_and_maps_agree() {
        #[derive(Serialize)]
        struct Context {
            timeframe: &'static str,
            symbol: &'static str,
        }

        let mut map = HashMap::new();
        map.insert("symbol", "ETH");
        map.insert("timeframe", "1h");

        let from_struct = content_hash(&Context {
            timeframe: "1h",
            symbol: "ETH",
        })
        .unwrap();
        assert_eq!(from_struct, content_hash(&map).unwrap());
    }

    #[test]
    fn test_idempotent() {
        let value = json!({"z": [{"b": 2, "a": 1}], "text": "quote \" and \\ and \u{e9}"});
        let canonical = canonicalize(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();

        assert_eq!(canonicalize(&reparsed).unwrap(), canonical);
    }

    #[test]
    fn test_hash_format() {
        let hash = content_hash(&json!({})).unwrap();
        assert_eq!(hash.as_str().len(), ContentHash::LEN);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        // sha256 of the two characters `{}`
        assert_eq!(
            hash.to_string(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_unsupported_values() {
        let mut map = HashMap::new();
        map.insert((1u8, 2u8), "tuple keys are not strings");
        assert!(matches!(
            canonicalize(&map),
            Err(CacheError::UnsupportedValue(_))
        ));

        struct Opaque;

        impl Serialize for Opaque {
            fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("opaque values cannot be serialized"))
            }
        }

        assert_eq!(
            content_hash(&Opaque),
            Err(CacheError::UnsupportedValue(
                "opaque values cannot be serialized".into()
            ))
        );
    }
}
