//! Wire messages between clients and document servers
//!
//! The transport is external; these are the values it carries. See
//! [`serialize`] for the byte encoding.

pub mod serialize;

use crate::ot::Operation;
use crate::sync::{Ack, Delta, DeltaSubmission, HashedVersion};
use crate::DocumentId;
use serde::{Deserialize, Serialize};

pub use serialize::{decode_message, encode_message};

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Start (or resume) following a document from `version`
    #[serde(rename_all = "camelCase")]
    Open {
        document_id: DocumentId,
        version: HashedVersion,
    },

    /// Submit a local delta
    #[serde(rename_all = "camelCase")]
    Submit {
        document_id: DocumentId,
        delta: DeltaSubmission,
    },
}

impl ClientMessage {
    pub fn document_id(&self) -> &str {
        match self {
            ClientMessage::Open { document_id, .. } | ClientMessage::Submit { document_id, .. } => {
                document_id
            }
        }
    }
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Deltas committed since the version the client opened at
    #[serde(rename_all = "camelCase")]
    CatchUp {
        document_id: DocumentId,
        deltas: Vec<Delta>,
    },

    /// The client's version is unknown; start over from this snapshot
    #[serde(rename_all = "camelCase")]
    ResyncRequired {
        document_id: DocumentId,
        snapshot: Operation,
        version: HashedVersion,
    },

    /// The client's delta was committed
    #[serde(rename_all = "camelCase")]
    Ack { document_id: DocumentId, ack: Ack },

    /// Some participant's delta was committed
    #[serde(rename_all = "camelCase")]
    Committed { document_id: DocumentId, delta: Delta },

    /// A submission was rejected
    #[serde(rename_all = "camelCase")]
    Rejected {
        document_id: DocumentId,
        reason: String,
    },
}

impl ServerMessage {
    pub fn document_id(&self) -> &str {
        match self {
            ServerMessage::CatchUp { document_id, .. }
            | ServerMessage::ResyncRequired { document_id, .. }
            | ServerMessage::Ack { document_id, .. }
            | ServerMessage::Committed { document_id, .. }
            | ServerMessage::Rejected { document_id, .. } => document_id,
        }
    }
}
