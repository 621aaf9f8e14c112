use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// The path that produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// The regular upstream, e.g. the configured LLM or market data provider.
    Primary,
    /// A secondary upstream the producer switched to.
    Fallback,
}

/// The output of a producer, before it is timestamped and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced<T> {
    pub payload: T,
    pub source: ArtifactSource,
}

impl<T> Produced<T> {
    pub fn fallback(payload: T) -> Self {
        Self {
            payload,
            source: ArtifactSource::Fallback,
        }
    }
}

impl<T> From<T> for Produced<T> {
    fn from(payload: T) -> Self {
        Self {
            payload,
            source: ArtifactSource::Primary,
        }
    }
}

/// A cached computation result.
///
/// This is the envelope written to the store, as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact<T> {
    pub payload: T,
    pub produced_at: DateTime<Utc>,
    pub source: ArtifactSource,
}

impl<T> Artifact<T> {
    pub fn new(produced: Produced<T>, produced_at: DateTime<Utc>) -> Self {
        Self {
            payload: produced.payload,
            produced_at,
            source: produced.source,
        }
    }
}

impl<T: Serialize> Artifact<T> {
    pub fn encode(&self) -> Result<Bytes, CacheError> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

impl<T: DeserializeOwned> Artifact<T> {
    /// Decodes an envelope previously written by [`encode`](Self::encode).
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
