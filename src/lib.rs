//! WaveSync Core - Operational transformation for shared documents
//!
//! This crate keeps replicas of a tree-structured, annotated document
//! consistent while many participants edit it at once. It implements:
//! - A document model of characters and nested elements with annotations
//! - Operations with transform, compose and invert
//! - Server-ordered concurrency control with hash-chained versions
//! - Client sessions with optimistic local edits and reconnection
//! - Undo/redo that only reverts the local participant's edits
//!
//! # Examples
//!
//! ```rust
//! use wavesync_core::ot::{transform, OperationBuilder};
//! use wavesync_core::Document;
//!
//! let mut seed = OperationBuilder::new();
//! seed.insert_characters("AB");
//! let doc = Document::new().apply(&seed.build()).unwrap();
//!
//! let mut alice = OperationBuilder::new();
//! alice.retain(1).insert_characters("X").retain(1);
//! let mut bob = OperationBuilder::new();
//! bob.delete_characters("A").retain(1);
//! let (alice, bob) = (alice.build(), bob.build());
//!
//! let pair = transform(&alice, &bob).unwrap();
//! let merged = doc.apply(&bob).unwrap().apply(&pair.client).unwrap();
//! assert_eq!(merged.text(), "XB");
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod ot;
pub mod protocol;
pub mod sync;
pub mod undo;

// Re-exports for convenience
pub use config::{ServerConfig, SessionConfig, SyncConfig};
pub use document::{Document, DocumentSink, Item, ItemKind};
pub use error::{Result, SyncError};
pub use ot::{Operation, OperationPair};
pub use sync::{ClientSession, DocumentServer, HashedVersion};
pub use undo::UndoManager;

/// Participant identifier type
pub type ParticipantId = String;

/// Document identifier type
pub type DocumentId = String;

/// Wall-clock time in milliseconds, as stamped on committed deltas
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
