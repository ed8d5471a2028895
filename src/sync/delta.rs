//! Deltas: operations stamped with authorship and version information

use super::version::HashedVersion;
use crate::error::Result;
use crate::ot::Operation;
use crate::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlates a submitted delta with its acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaId(Uuid);

impl DeltaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeltaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A delta as sent by a client: an operation over a version the client has
/// seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSubmission {
    pub id: DeltaId,
    pub author: ParticipantId,
    pub base_version: HashedVersion,
    #[serde(rename = "operationComponents")]
    pub operation: Operation,
}

impl DeltaSubmission {
    pub fn new(author: impl Into<ParticipantId>, base_version: HashedVersion, operation: Operation) -> Self {
        Self {
            id: DeltaId::new(),
            author: author.into(),
            base_version,
            operation,
        }
    }
}

/// A committed delta, as stored in the history and broadcast to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub id: DeltaId,
    pub author: ParticipantId,
    pub timestamp_millis: i64,
    pub base_version: HashedVersion,
    #[serde(rename = "operationComponents")]
    pub operation: Operation,
    pub resulting_version: HashedVersion,
}

impl Delta {
    /// Stamp an operation committed at `base_version`, computing the resulting
    /// version from the delta's canonical bytes
    pub fn commit(
        id: DeltaId,
        author: ParticipantId,
        timestamp_millis: i64,
        base_version: HashedVersion,
        operation: Operation,
    ) -> Result<Self> {
        let bytes = canonical_bytes(&id, &author, timestamp_millis, &base_version, &operation)?;
        let resulting_version = base_version.next(&bytes);
        Ok(Self {
            id,
            author,
            timestamp_millis,
            base_version,
            operation,
            resulting_version,
        })
    }

    /// Recompute the resulting version and compare it with the stored one
    pub fn verify(&self) -> Result<bool> {
        let bytes = canonical_bytes(
            &self.id,
            &self.author,
            self.timestamp_millis,
            &self.base_version,
            &self.operation,
        )?;
        Ok(self.base_version.next(&bytes) == self.resulting_version)
    }
}

/// Everything in a delta except its resulting version, in a fixed encoding
fn canonical_bytes(
    id: &DeltaId,
    author: &str,
    timestamp_millis: i64,
    base_version: &HashedVersion,
    operation: &Operation,
) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Canonical<'a> {
        id: &'a DeltaId,
        author: &'a str,
        timestamp_millis: i64,
        base_version: &'a HashedVersion,
        operation_components: &'a Operation,
    }

    Ok(serde_json::to_vec(&Canonical {
        id,
        author,
        timestamp_millis,
        base_version,
        operation_components: operation,
    })?)
}

/// Server acknowledgement of a submitted delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub delta_id: DeltaId,
    pub resulting_version: HashedVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed() -> Delta {
        Delta::commit(
            DeltaId::new(),
            "alice@example.com".into(),
            1_700_000_000_000,
            HashedVersion::version_zero("doc"),
            Operation::identity(0),
        )
        .unwrap()
    }

    #[test]
    fn test_commit_advances_version() {
        let delta = committed();
        assert_eq!(delta.resulting_version.version(), 1);
        assert!(delta.verify().unwrap());
    }

    #[test]
    fn test_tampering_detected() {
        let mut delta = committed();
        delta.author = "mallory@example.com".into();
        assert!(!delta.verify().unwrap());
    }

    #[test]
    fn test_wire_field_names() {
        let delta = committed();
        let json = serde_json::to_value(&delta).unwrap();
        let object = json.as_object().unwrap();
        for field in [
            "id",
            "author",
            "timestampMillis",
            "baseVersion",
            "operationComponents",
            "resultingVersion",
        ] {
            assert!(object.contains_key(field), "missing {}", field);
        }
        assert_eq!(serde_json::from_value::<Delta>(json).unwrap(), delta);
    }
}
