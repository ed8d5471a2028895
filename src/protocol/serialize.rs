//! Serialization layer - protocol messages to and from bytes
//!
//! Messages are encoded as JSON with camelCase field names. Hashed versions
//! travel in their text form and delta ids as hyphenated UUIDs.

use crate::error::{Result, SyncError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize any protocol message to bytes
pub fn encode_message<M: Serialize>(msg: &M) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(256).writer();
    serde_json::to_writer(&mut buf, msg)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode message: {}", e)))?;
    Ok(buf.into_inner().freeze())
}

/// Deserialize a protocol message from bytes
pub fn decode_message<M: DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Serialization(format!("Failed to decode message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::{Component, Operation};
    use crate::protocol::{ClientMessage, ServerMessage};
    use crate::sync::{Ack, DeltaId, DeltaSubmission, HashedVersion};

    #[test]
    fn test_client_message_round_trip() {
        let msg = ClientMessage::Submit {
            document_id: "doc-1".into(),
            delta: DeltaSubmission::new(
                "alice",
                HashedVersion::new(5678, vec![0x81, 0xD3, 0x00, 0x2D, 0x6E, 0x7F]),
                Operation::from_components(vec![
                    Component::Retain(2),
                    Component::InsertCharacters("hi".into()),
                ]),
            ),
        };

        let bytes = encode_message(&msg).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"type\":\"submit\""));
        assert!(text.contains("\"baseVersion\":\"5678:gdMALW5/\""));
        assert!(text.contains("\"operationComponents\""));

        let back: ClientMessage = decode_message(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_server_message_round_trip() {
        let msg = ServerMessage::Ack {
            document_id: "doc-1".into(),
            ack: Ack {
                delta_id: DeltaId::new(),
                resulting_version: HashedVersion::unsigned(3),
            },
        };

        let bytes = encode_message(&msg).unwrap();
        let back: ServerMessage = decode_message(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.document_id(), "doc-1");
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<ClientMessage> = decode_message(b"{\"type\":\"bogus\"}");
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }
}
