//! Error types for WaveSync
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! onto the recovery paths of the concurrency-control protocol: some are
//! fatal for the affected session and force a resync, others only reject a
//! single local edit.

use crate::sync::HashedVersion;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by the OT engine and the sync protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Applying the operation would leave the document ill-formed, or the
    /// operation disagrees with the document content it walks over.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The operation's base extent does not match the document size
    #[error("size mismatch: operation expects {expected} items, document has {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Two operations could not have been derived from a common base
    #[error("transform incompatible: {0}")]
    TransformIncompatible(String),

    /// An operation chain is misordered or corrupted
    #[error("compose incompatible: {0}")]
    ComposeIncompatible(String),

    /// A version the server does not recognise, or a delta built on one
    #[error("stale or unknown version {0}")]
    StaleOrUnknownVersion(HashedVersion),

    /// The session can no longer be trusted and must resynchronize
    #[error("session degraded: {0}")]
    SessionDegraded(String),

    /// A hashed version string could not be parsed
    #[error("invalid version encoding: {0}")]
    InvalidVersion(String),

    /// No pending delta with the given id
    #[error("unknown delta {0}")]
    UnknownDelta(String),

    /// Protocol-level misuse (unexpected message, state machine violation)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoding or decoding a wire payload failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Whether this error leaves the session unusable until a full resync
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SyncError::SizeMismatch { .. }
                | SyncError::TransformIncompatible(_)
                | SyncError::ComposeIncompatible(_)
                | SyncError::StaleOrUnknownVersion(_)
                | SyncError::SessionDegraded(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
