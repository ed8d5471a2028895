//! Hashed versions
//!
//! Every committed delta advances a document's version by one and extends a
//! hash chain over the history, so a version number alone can be forged or
//! confused across histories while a `(version, hash)` pair cannot.

use crate::error::{Result, SyncError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of the truncated SHA-256 hash carried by a version
pub const HASH_LEN: usize = 20;

/// A version number paired with the history hash at that version
///
/// Text form is `"<version>:<base64 hash>"`, e.g. `"5678:gdMALW5/"`. An
/// unsigned version has an empty hash and renders as `"5678:"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashedVersion {
    version: u64,
    hash: Vec<u8>,
}

impl HashedVersion {
    pub fn new(version: u64, hash: Vec<u8>) -> Self {
        Self { version, hash }
    }

    /// A version without a history hash
    pub fn unsigned(version: u64) -> Self {
        Self {
            version,
            hash: Vec::new(),
        }
    }

    /// Version 0 of a document, derived from its identifier
    pub fn version_zero(document_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"wave://");
        hasher.update(document_id.as_bytes());
        Self {
            version: 0,
            hash: truncate(hasher.finalize().as_slice()),
        }
    }

    /// The version reached by committing a delta with the given canonical
    /// bytes on top of this one
    pub fn next(&self, delta_bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&self.hash);
        hasher.update(delta_bytes);
        Self {
            version: self.version + 1,
            hash: truncate(hasher.finalize().as_slice()),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn is_signed(&self) -> bool {
        !self.hash.is_empty()
    }
}

fn truncate(digest: &[u8]) -> Vec<u8> {
    digest[..HASH_LEN.min(digest.len())].to_vec()
}

impl fmt::Display for HashedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = base64::engine::general_purpose::STANDARD;
        write!(f, "{}:{}", self.version, engine.encode(&self.hash))
    }
}

impl FromStr for HashedVersion {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (version, hash) = s
            .split_once(':')
            .ok_or_else(|| SyncError::InvalidVersion(format!("missing ':' in {:?}", s)))?;
        let version = version
            .parse::<u64>()
            .map_err(|e| SyncError::InvalidVersion(format!("bad version number in {:?}: {}", s, e)))?;
        let engine = base64::engine::general_purpose::STANDARD;
        let hash = engine
            .decode(hash)
            .map_err(|e| SyncError::InvalidVersion(format!("bad hash in {:?}: {}", s, e)))?;
        Ok(Self { version, hash })
    }
}

impl Serialize for HashedVersion {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HashedVersion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
