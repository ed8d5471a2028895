//! Client side of the concurrency-control protocol
//!
//! A [`ClientSession`] applies local edits optimistically and reconciles
//! them with the server:
//!
//! - at most one delta is in flight; the rest wait in a queue
//! - a remote delta is transformed against the in-flight and queued deltas
//!   before it is applied, and they are transformed against it in turn
//! - an ack retires the in-flight delta and advances the server version
//! - a missing ack degrades the session; recovery goes through reconnect,
//!   never through blind retransmission
//!
//! Every pending delta moves through [`PendingState`]:
//! `Queued → Sent → Acknowledged`, or `Queued → Sent → Rebased → Acknowledged`
//! when remote deltas arrive while it is in flight.

use super::delta::{Ack, Delta, DeltaId, DeltaSubmission};
use super::version::HashedVersion;
use crate::config::SessionConfig;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::ot::{compose, invert, transform, Operation};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::{DocumentId, ParticipantId};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Lifecycle of a locally created delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Applied locally, not yet sent; may still be cancelled
    Queued,
    /// Sent and awaiting acknowledgement
    Sent,
    /// Sent, then transformed over remote deltas that arrived before its ack
    Rebased,
    /// Committed by the server
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    /// An ack went missing or the server sent something inconsistent;
    /// the session must reconnect before sending again
    Degraded,
}

/// A local delta the server has not acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelta {
    pub id: DeltaId,
    /// Applies to the server state plus every pending delta ahead of this one
    pub operation: Operation,
    pub state: PendingState,
    /// Created while disconnected
    pub offline: bool,
    pub sent_at_millis: Option<i64>,
}

impl PendingDelta {
    fn queued(operation: Operation, offline: bool) -> Self {
        Self {
            id: DeltaId::new(),
            operation,
            state: PendingState::Queued,
            offline,
            sent_at_millis: None,
        }
    }
}

/// A remote operation reconciled with the pending deltas
struct Rebased {
    in_flight: Option<Operation>,
    queued: Vec<Operation>,
    /// The remote operation as it applies to the local document
    remote: Operation,
    document: Document,
}

#[derive(Debug)]
pub struct ClientSession {
    document_id: DocumentId,
    participant: ParticipantId,
    document: Document,
    server_version: HashedVersion,
    in_flight: Option<PendingDelta>,
    /// Most recently retired delta, so a late duplicate ack is recognised
    last_acked: Option<PendingDelta>,
    queue: VecDeque<PendingDelta>,
    state: SessionState,
    config: SessionConfig,
}

impl ClientSession {
    /// A connected session over `document` at `server_version`
    pub fn new(
        document_id: impl Into<DocumentId>,
        participant: impl Into<ParticipantId>,
        document: Document,
        server_version: HashedVersion,
        config: SessionConfig,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            participant: participant.into(),
            document,
            server_version,
            in_flight: None,
            last_acked: None,
            queue: VecDeque::new(),
            state: SessionState::Connected,
            config,
        }
    }

    /// A session that still has to open the document; it starts from an empty
    /// document and catches up or resyncs once connected
    pub fn detached(
        document_id: impl Into<DocumentId>,
        participant: impl Into<ParticipantId>,
        config: SessionConfig,
    ) -> Self {
        let document_id = document_id.into();
        let version = HashedVersion::version_zero(&document_id);
        let mut session = Self::new(document_id, participant, Document::new(), version, config);
        session.state = SessionState::Disconnected;
        session
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn server_version(&self) -> &HashedVersion {
        &self.server_version
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&PendingDelta> {
        self.in_flight.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &PendingDelta> {
        self.queue.iter()
    }

    /// Whether every local edit has been acknowledged
    pub fn is_settled(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Apply a local edit and queue it for sending
    ///
    /// # Errors
    ///
    /// Apply errors; the edit is rejected and nothing is queued.
    pub fn local_edit(&mut self, op: &Operation) -> Result<DeltaId> {
        self.document = self.document.apply(op)?;
        let pending = PendingDelta::queued(op.clone(), self.state != SessionState::Connected);
        let id = pending.id;
        trace!(delta = %id, offline = pending.offline, "queued local edit");
        self.queue.push_back(pending);
        Ok(id)
    }

    /// Next delta to send, if nothing is in flight
    ///
    /// Queued deltas are merged into one when coalescing is enabled; the
    /// merged delta keeps the id of the oldest one.
    pub fn take_outgoing(&mut self, now_millis: i64) -> Result<Option<DeltaSubmission>> {
        if self.state != SessionState::Connected || self.in_flight.is_some() {
            return Ok(None);
        }
        let merged = if self.config.coalesce_queued && self.queue.len() > 1 {
            let ops: Vec<Operation> = self.queue.iter().map(|pending| pending.operation.clone()).collect();
            Some(compose(&ops)?)
        } else {
            None
        };
        let Some(mut next) = self.queue.pop_front() else {
            return Ok(None);
        };

        if let Some(operation) = merged {
            next.operation = operation;
            next.offline |= self.queue.iter().any(|pending| pending.offline);
            trace!(delta = %next.id, merged = self.queue.len(), "coalesced queued deltas");
            self.queue.clear();
        }

        next.state = PendingState::Sent;
        next.sent_at_millis = Some(now_millis);
        let submission = DeltaSubmission {
            id: next.id,
            author: self.participant.clone(),
            base_version: self.server_version.clone(),
            operation: next.operation.clone(),
        };
        self.in_flight = Some(next);
        Ok(Some(submission))
    }

    /// [`take_outgoing`](Self::take_outgoing) wrapped in a protocol message
    pub fn outgoing_message(&mut self, now_millis: i64) -> Result<Option<ClientMessage>> {
        Ok(self.take_outgoing(now_millis)?.map(|delta| ClientMessage::Submit {
            document_id: self.document_id.clone(),
            delta,
        }))
    }

    /// Reconcile and apply a delta committed by the server
    ///
    /// Returns the operation that was applied to the local document (the
    /// remote operation transformed past every pending local delta). Our own
    /// in-flight delta echoed back counts as its acknowledgement and changes
    /// nothing locally.
    pub fn on_remote_delta(&mut self, delta: &Delta) -> Result<Operation> {
        if self.in_flight.as_ref().is_some_and(|pending| pending.id == delta.id) {
            self.on_ack(&Ack {
                delta_id: delta.id,
                resulting_version: delta.resulting_version.clone(),
            })?;
            return Ok(Operation::identity(self.document.len()));
        }
        if delta.resulting_version == self.server_version {
            trace!(delta = %delta.id, "already acknowledged");
            return Ok(Operation::identity(self.document.len()));
        }

        if delta.base_version != self.server_version {
            return Err(self.degrade(SyncError::StaleOrUnknownVersion(delta.base_version.clone())));
        }

        let Rebased {
            in_flight,
            queued,
            remote,
            document,
        } = match self.rebase_pending(&delta.operation) {
            Ok(rebased) => rebased,
            Err(err) => return Err(self.degrade(err)),
        };

        if let (Some(pending), Some(op)) = (self.in_flight.as_mut(), in_flight) {
            pending.operation = op;
            pending.state = PendingState::Rebased;
        }
        for (pending, op) in self.queue.iter_mut().zip(queued) {
            pending.operation = op;
        }
        self.document = document;
        self.server_version = delta.resulting_version.clone();
        debug!(delta = %delta.id, version = %self.server_version, "applied remote delta");

        Ok(remote)
    }

    /// Transform `remote` past every pending delta and apply it to a copy of
    /// the document; nothing is changed on failure
    fn rebase_pending(&self, remote: &Operation) -> Result<Rebased> {
        let mut remote = remote.clone();
        let in_flight = match &self.in_flight {
            Some(pending) => {
                let (local, rest) = transform(&pending.operation, &remote)?.into_tuple();
                remote = rest;
                Some(local)
            }
            None => None,
        };
        let mut queued = Vec::with_capacity(self.queue.len());
        for pending in &self.queue {
            let (local, rest) = transform(&pending.operation, &remote)?.into_tuple();
            remote = rest;
            queued.push(local);
        }
        let document = self.document.apply(&remote)?;
        Ok(Rebased {
            in_flight,
            queued,
            remote,
            document,
        })
    }

    /// Retire the in-flight delta
    ///
    /// An ack for the delta just retired by its echo is accepted again and
    /// changes nothing.
    pub fn on_ack(&mut self, ack: &Ack) -> Result<PendingDelta> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|pending| pending.id == ack.delta_id);
        if !matches {
            if let Some(previous) = self.last_acked.as_ref().filter(|previous| {
                previous.id == ack.delta_id
                    && ack.resulting_version.version() <= self.server_version.version()
            }) {
                trace!(delta = %ack.delta_id, "duplicate ack");
                return Ok(previous.clone());
            }
            return Err(SyncError::UnknownDelta(ack.delta_id.to_string()));
        }
        if ack.resulting_version.version() != self.server_version.version() + 1 {
            return Err(self.degrade(SyncError::Protocol(format!(
                "ack for {} at {} does not follow {}",
                ack.delta_id, ack.resulting_version, self.server_version
            ))));
        }

        let mut pending = self
            .in_flight
            .take()
            .ok_or_else(|| SyncError::UnknownDelta(ack.delta_id.to_string()))?;
        pending.state = PendingState::Acknowledged;
        self.server_version = ack.resulting_version.clone();
        debug!(delta = %ack.delta_id, version = %self.server_version, "delta acknowledged");
        self.last_acked = Some(pending.clone());
        Ok(pending)
    }

    /// Degrade the session if the in-flight delta has waited too long
    ///
    /// # Errors
    ///
    /// [`SyncError::SessionDegraded`] once the ack timeout has passed.
    pub fn check_timeout(&mut self, now_millis: i64) -> Result<()> {
        let Some(sent_at) = self.in_flight.as_ref().and_then(|pending| pending.sent_at_millis) else {
            return Ok(());
        };
        let timeout = i64::try_from(self.config.ack_timeout_ms).unwrap_or(i64::MAX);
        if now_millis.saturating_sub(sent_at) >= timeout {
            let reason = format!("no ack within {}ms", self.config.ack_timeout_ms);
            return Err(self.degrade(SyncError::SessionDegraded(reason)));
        }
        Ok(())
    }

    /// Withdraw a queued delta before it is sent
    ///
    /// Returns the operation applied to the local document to revert it.
    ///
    /// # Errors
    ///
    /// [`SyncError::Protocol`] if the delta is already in flight,
    /// [`SyncError::UnknownDelta`] if no pending delta has this id.
    pub fn cancel(&mut self, id: DeltaId) -> Result<Operation> {
        if self.in_flight.as_ref().is_some_and(|pending| pending.id == id) {
            return Err(SyncError::Protocol(format!(
                "delta {} was already sent and cannot be cancelled",
                id
            )));
        }
        let index = self
            .queue
            .iter()
            .position(|pending| pending.id == id)
            .ok_or_else(|| SyncError::UnknownDelta(id.to_string()))?;

        let mut revert = invert(&self.queue[index].operation);
        let mut later = Vec::with_capacity(self.queue.len() - index - 1);
        for pending in self.queue.iter().skip(index + 1) {
            let (local, rest) = transform(&pending.operation, &revert)?.into_tuple();
            revert = rest;
            later.push(local);
        }
        self.document = self.document.apply(&revert)?;

        for (pending, op) in self.queue.iter_mut().skip(index + 1).zip(later) {
            pending.operation = op;
        }
        self.queue.remove(index);
        debug!(delta = %id, "cancelled queued delta");
        Ok(revert)
    }

    pub fn disconnect(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Disconnected;
        }
    }

    /// The message that reopens the document at our last confirmed version
    pub fn reconnect_message(&self) -> ClientMessage {
        ClientMessage::Open {
            document_id: self.document_id.clone(),
            version: self.server_version.clone(),
        }
    }

    /// Replay deltas missed while disconnected and resume
    ///
    /// Our own in-flight delta among them counts as acknowledged. If it is
    /// not among them the server never committed it, and it is queued again
    /// under the same id, so a late duplicate is still recognised.
    pub fn on_catch_up(&mut self, deltas: &[Delta]) -> Result<Vec<Operation>> {
        let mut applied = Vec::with_capacity(deltas.len());
        for delta in deltas {
            applied.push(self.on_remote_delta(delta)?);
        }

        if let Some(mut pending) = self.in_flight.take() {
            trace!(delta = %pending.id, "in-flight delta not committed, requeueing");
            pending.state = PendingState::Queued;
            pending.sent_at_millis = None;
            self.queue.push_front(pending);
        }
        self.state = SessionState::Connected;
        Ok(applied)
    }

    /// Start over from a server snapshot
    ///
    /// Edits made while offline are replayed on the snapshot where they
    /// still apply; everything else pending is discarded.
    pub fn on_resync(&mut self, snapshot: &Operation, version: HashedVersion) -> Result<()> {
        let mut document = Document::from_operation(snapshot)?;
        let mut kept = VecDeque::new();
        let pending = self.in_flight.take().into_iter().chain(self.queue.drain(..));

        for mut delta in pending {
            if !delta.offline {
                trace!(delta = %delta.id, "discarding pending delta on resync");
                continue;
            }
            match document.apply(&delta.operation) {
                Ok(next) => {
                    document = next;
                    delta.state = PendingState::Queued;
                    delta.sent_at_millis = None;
                    kept.push_back(delta);
                }
                Err(err) => warn!(delta = %delta.id, %err, "offline edit no longer applies"),
            }
        }

        debug!(version = %version, kept = kept.len(), "resynchronized from snapshot");
        self.document = document;
        self.server_version = version;
        self.queue = kept;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Feed one server message through the session
    ///
    /// Returns the operations applied to the local document, in order. After a
    /// resync the document is replaced wholesale and nothing is returned.
    pub fn handle(&mut self, message: ServerMessage) -> Result<Vec<Operation>> {
        if message.document_id() != self.document_id {
            return Err(SyncError::Protocol(format!(
                "message for {} delivered to session of {}",
                message.document_id(),
                self.document_id
            )));
        }
        match message {
            ServerMessage::CatchUp { deltas, .. } => self.on_catch_up(&deltas),
            ServerMessage::ResyncRequired {
                snapshot, version, ..
            } => {
                self.on_resync(&snapshot, version)?;
                Ok(Vec::new())
            }
            ServerMessage::Ack { ack, .. } => {
                self.on_ack(&ack)?;
                Ok(Vec::new())
            }
            ServerMessage::Committed { delta, .. } => Ok(vec![self.on_remote_delta(&delta)?]),
            ServerMessage::Rejected { reason, .. } => {
                Err(self.degrade(SyncError::Protocol(format!("submission rejected: {}", reason))))
            }
        }
    }

    fn degrade(&mut self, err: SyncError) -> SyncError {
        warn!(document = %self.document_id, %err, "session degraded");
        self.state = SessionState::Degraded;
        err
    }
}
