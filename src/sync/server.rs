//! Per-document serialization point
//!
//! A [`DocumentServer`] owns the authoritative document and its history. All
//! submissions for one document go through it one at a time: a submission
//! built on an older version is transformed across every delta committed
//! since, applied, hashed, appended and acknowledged.

use super::delta::{Ack, Delta, DeltaId, DeltaSubmission};
use super::history::{DeltaHistory, InMemoryDeltaHistory};
use super::version::HashedVersion;
use crate::config::ServerConfig;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::ot::{transform, Operation};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::DocumentId;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Outcome of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    /// Goes back to the submitter
    pub ack: Ack,
    /// Goes to every other participant. `None` when the submission was a
    /// duplicate and nothing new was committed.
    pub delta: Option<Delta>,
}

/// Answer to a client opening the document at some version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    CatchUp(Vec<Delta>),
    Resync {
        snapshot: Operation,
        version: HashedVersion,
    },
}

#[derive(Debug)]
pub struct DocumentServer<H = InMemoryDeltaHistory> {
    document_id: DocumentId,
    document: Document,
    history: H,
    /// Resulting version of recently committed deltas, by id
    committed: HashMap<DeltaId, HashedVersion>,
    /// Commit order of the ids in `committed`, oldest first
    committed_order: VecDeque<DeltaId>,
    config: ServerConfig,
}

impl DocumentServer<InMemoryDeltaHistory> {
    /// A new, empty document at version zero
    pub fn new(document_id: impl Into<DocumentId>, config: ServerConfig) -> Self {
        let document_id = document_id.into();
        let history = InMemoryDeltaHistory::for_document(&document_id);
        Self::with_history(document_id, Document::new(), history, config)
    }
}

impl<H: DeltaHistory> DocumentServer<H> {
    /// Resume from an existing history; `document` must be the state at the
    /// history's current version
    pub fn with_history(
        document_id: impl Into<DocumentId>,
        document: Document,
        history: H,
        config: ServerConfig,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            document,
            history,
            committed: HashMap::new(),
            committed_order: VecDeque::new(),
            config,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn current_version(&self) -> HashedVersion {
        self.history.current_version()
    }

    /// Snapshot of the current state as an insert-only operation
    pub fn snapshot(&self) -> (Operation, HashedVersion) {
        (self.document.to_operation(), self.current_version())
    }

    /// Commit a client delta
    ///
    /// # Errors
    ///
    /// - [`SyncError::StaleOrUnknownVersion`] if the base version is not in
    ///   the history (wrong hash included)
    /// - transform and apply errors; the document and history are unchanged
    pub fn submit(&mut self, submission: DeltaSubmission, timestamp_millis: i64) -> Result<Submitted> {
        if let Some(resulting_version) = self.committed.get(&submission.id) {
            debug!(delta = %submission.id, "duplicate submission, re-acknowledging");
            return Ok(Submitted {
                ack: Ack {
                    delta_id: submission.id,
                    resulting_version: resulting_version.clone(),
                },
                delta: None,
            });
        }

        if !self.history.has_signature(&submission.base_version) {
            warn!(
                document = %self.document_id,
                base = %submission.base_version,
                "submission against unknown version"
            );
            return Err(SyncError::StaleOrUnknownVersion(submission.base_version));
        }

        let mut operation = submission.operation;
        let concurrent = self.history.deltas_since(&submission.base_version)?;
        for committed in &concurrent {
            operation = transform(&operation, &committed.operation)?.client;
        }
        if !concurrent.is_empty() {
            trace!(delta = %submission.id, over = concurrent.len(), "rebased submission");
        }

        let document = self.document.apply(&operation)?;
        let delta = Delta::commit(
            submission.id,
            submission.author,
            timestamp_millis,
            self.history.current_version(),
            operation,
        )?;
        self.history.append(delta.clone())?;
        self.document = document;
        self.remember(delta.id, delta.resulting_version.clone());

        debug!(
            document = %self.document_id,
            delta = %delta.id,
            version = %delta.resulting_version,
            "committed delta"
        );

        Ok(Submitted {
            ack: Ack {
                delta_id: delta.id,
                resulting_version: delta.resulting_version.clone(),
            },
            delta: Some(delta),
        })
    }

    /// Keep the id for duplicate detection
    ///
    /// Only the last `max_catch_up_deltas` ids are kept. A client resubmits
    /// only after a successful catch-up, which never spans more than that.
    fn remember(&mut self, id: DeltaId, resulting_version: HashedVersion) {
        self.committed.insert(id, resulting_version);
        self.committed_order.push_back(id);
        while self.committed_order.len() > self.config.max_catch_up_deltas.max(1) {
            if let Some(oldest) = self.committed_order.pop_front() {
                self.committed.remove(&oldest);
            }
        }
    }

    /// Deltas a client at `version` needs to catch up
    ///
    /// # Errors
    ///
    /// [`SyncError::StaleOrUnknownVersion`] if `version` is not in the
    /// history or the gap is too large to replay.
    pub fn catch_up(&self, version: &HashedVersion) -> Result<Vec<Delta>> {
        let current = self.current_version().version();
        if version.version() <= current
            && current - version.version() > self.config.max_catch_up_deltas as u64
        {
            return Err(SyncError::StaleOrUnknownVersion(version.clone()));
        }
        self.history.deltas_since(version)
    }

    /// Catch-up deltas, or a snapshot when the client cannot catch up
    pub fn open(&self, version: &HashedVersion) -> Opened {
        match self.catch_up(version) {
            Ok(deltas) => Opened::CatchUp(deltas),
            Err(err) => {
                debug!(document = %self.document_id, %version, %err, "client must resync");
                let (snapshot, version) = self.snapshot();
                Opened::Resync { snapshot, version }
            }
        }
    }

    /// Handle one client message
    ///
    /// Returns the reply for the sender and, when something was committed, the
    /// message to broadcast to everyone else.
    pub fn handle(
        &mut self,
        message: ClientMessage,
        timestamp_millis: i64,
    ) -> (ServerMessage, Option<ServerMessage>) {
        let document_id = self.document_id.clone();
        match message {
            ClientMessage::Open { version, .. } => {
                let reply = match self.open(&version) {
                    Opened::CatchUp(deltas) => ServerMessage::CatchUp { document_id, deltas },
                    Opened::Resync { snapshot, version } => ServerMessage::ResyncRequired {
                        document_id,
                        snapshot,
                        version,
                    },
                };
                (reply, None)
            }
            ClientMessage::Submit { delta, .. } => match self.submit(delta, timestamp_millis) {
                Ok(Submitted { ack, delta }) => (
                    ServerMessage::Ack {
                        document_id: document_id.clone(),
                        ack,
                    },
                    delta.map(|delta| ServerMessage::Committed { document_id, delta }),
                ),
                Err(err) if err.requires_resync() => {
                    let (snapshot, version) = self.snapshot();
                    (
                        ServerMessage::ResyncRequired {
                            document_id,
                            snapshot,
                            version,
                        },
                        None,
                    )
                }
                Err(err) => (
                    ServerMessage::Rejected {
                        document_id,
                        reason: err.to_string(),
                    },
                    None,
                ),
            },
        }
    }
}
