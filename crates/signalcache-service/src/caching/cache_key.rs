use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use super::canonical::{ContentHash, content_hash};
use super::{CacheError, ComputationType};

/// The key under which an artifact is stored.
///
/// It has the human-inspectable form `{computation}:{reference_id}:v{version}:{content_hash}`.
/// The `reference_id` is escaped so that it never contains a `:`, which keeps the key
/// unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    key: Arc<str>,
    computation: ComputationType,
    version: u32,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] from its already hashed parts.
    pub fn new(
        computation: ComputationType,
        reference_id: &str,
        version: u32,
        content_hash: &ContentHash,
    ) -> Self {
        let mut key = format!("{computation}:");
        escape_segment(&mut key, reference_id);
        key.push_str(&format!(":v{version}:{content_hash}"));

        Self {
            key: key.into(),
            computation,
            version,
        }
    }

    /// Derives the [`CacheKey`] for a computation over the given `context` payload.
    ///
    /// Payloads that are equal up to map key order produce the same key.
    pub fn for_context<C: Serialize + ?Sized>(
        computation: ComputationType,
        reference_id: &str,
        version: u32,
        context: &C,
    ) -> Result<Self, CacheError> {
        Ok(Self::new(
            computation,
            reference_id,
            version,
            &content_hash(context)?,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn computation(&self) -> ComputationType {
        self.computation
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// The given string is not a valid [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cache key `{key}`: {reason}")]
pub struct InvalidCacheKey {
    key: String,
    reason: &'static str,
}

impl FromStr for CacheKey {
    type Err = InvalidCacheKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidCacheKey {
            key: s.to_owned(),
            reason,
        };

        let mut parts = s.split(':');
        let (Some(computation), Some(reference_id), Some(version), Some(hash), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid("expected four `:` separated segments"));
        };

        let computation = computation
            .parse()
            .map_err(|_| invalid("unknown computation type"))?;
        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| invalid("version must look like `v1`"))?;
        if reference_id.is_empty() {
            return Err(invalid("empty reference id"));
        }
        if hash.len() != ContentHash::LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("content hash must be 64 hex digits"));
        }

        Ok(Self {
            key: s.into(),
            computation,
            version,
        })
    }
}

/// Percent-escapes `%`, `:` and whitespace, so distinct reference ids stay distinct.
fn escape_segment(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '%' | ':' => out.push_str(if c == '%' { "%25" } else { "%3A" }),
            c if c.is_whitespace() => {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
            c => out.push(c),
        }
    }
}
