//! Document servers running as tokio tasks
//!
//! Each open document gets its own task that owns a [`DocumentServer`].
//! Requests reach it through a bounded command channel and are handled one at
//! a time, so the task is the document's serialization point. Committed
//! deltas are fanned out to subscribers over a broadcast channel.

use super::server::DocumentServer;
use super::version::HashedVersion;
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::ot::Operation;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::DocumentId;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

enum Command {
    Handle {
        message: ClientMessage,
        reply: oneshot::Sender<ServerMessage>,
    },
    Snapshot {
        reply: oneshot::Sender<(Operation, HashedVersion)>,
    },
}

/// Cheap, cloneable access to one running document
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    document_id: DocumentId,
    commands: mpsc::Sender<Command>,
    committed: broadcast::Sender<ServerMessage>,
}

impl DocumentHandle {
    /// Start a task serving `server`. Must be called inside a tokio runtime.
    pub fn spawn(server: DocumentServer, config: &ServerConfig) -> Self {
        let (commands, inbox) = mpsc::channel(config.command_buffer.max(1));
        let (committed, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let document_id = server.document_id().to_string();

        tokio::spawn(run(server, inbox, committed.clone()));

        Self {
            document_id,
            commands,
            committed,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Send a client message and wait for the reply meant for its sender
    ///
    /// # Errors
    ///
    /// [`SyncError::Protocol`] if the message names another document or the
    /// document task has stopped.
    pub async fn send(&self, message: ClientMessage) -> Result<ServerMessage> {
        if message.document_id() != self.document_id {
            return Err(SyncError::Protocol(format!(
                "message for {} sent to {}",
                message.document_id(),
                self.document_id
            )));
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Handle { message, reply })
            .await
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    /// Current document and version as seen by the task
    pub async fn snapshot(&self) -> Result<(Operation, HashedVersion)> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    /// Receive every delta committed from now on, as
    /// [`ServerMessage::Committed`]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.committed.subscribe()
    }

    fn stopped(&self) -> SyncError {
        SyncError::Protocol(format!("document task for {} has stopped", self.document_id))
    }
}

async fn run(
    mut server: DocumentServer,
    mut inbox: mpsc::Receiver<Command>,
    committed: broadcast::Sender<ServerMessage>,
) {
    debug!(document = %server.document_id(), "document task started");

    while let Some(command) = inbox.recv().await {
        match command {
            Command::Handle { message, reply } => {
                let (response, broadcast) = server.handle(message, crate::now_millis());
                if let Some(broadcast) = broadcast {
                    // No subscribers is fine
                    let _ = committed.send(broadcast);
                }
                let _ = reply.send(response);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(server.snapshot());
            }
        }
    }

    debug!(document = %server.document_id(), "document task stopped");
}

/// Routes client messages to per-document tasks, starting them on first use
#[derive(Debug, Default)]
pub struct DocumentHub {
    config: ServerConfig,
    documents: HashMap<DocumentId, DocumentHandle>,
}

impl DocumentHub {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            documents: HashMap::new(),
        }
    }

    /// Handle for `document_id`, starting an empty document if needed
    pub fn document(&mut self, document_id: &str) -> DocumentHandle {
        if let Some(handle) = self.documents.get(document_id) {
            return handle.clone();
        }
        info!(document = %document_id, "starting document task");
        let server = DocumentServer::new(document_id, self.config.clone());
        let handle = DocumentHandle::spawn(server, &self.config);
        self.documents.insert(document_id.to_string(), handle.clone());
        handle
    }

    /// Forward a message to the task for the document it names
    pub async fn route(&mut self, message: ClientMessage) -> Result<ServerMessage> {
        let handle = self.document(message.document_id());
        handle.send(message).await
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::document::Document;
    use crate::ot::OperationBuilder;
    use crate::sync::{ClientSession, DeltaSubmission, SessionState};

    fn insert_at(pos: usize, len: usize, text: &str) -> Operation {
        let mut b = OperationBuilder::new();
        b.retain(pos).insert_characters(text).retain(len - pos);
        b.build()
    }

    #[tokio::test]
    async fn test_submit_and_broadcast() {
        let mut hub = DocumentHub::new(ServerConfig::default());
        let handle = hub.document("notes");
        let mut committed = handle.subscribe();

        let (_, v0) = handle.snapshot().await.unwrap();
        let submission = DeltaSubmission::new("alice", v0, insert_at(0, 0, "hi"));
        let reply = hub
            .route(ClientMessage::Submit {
                document_id: "notes".into(),
                delta: submission.clone(),
            })
            .await
            .unwrap();

        match reply {
            ServerMessage::Ack { ack, .. } => assert_eq!(ack.delta_id, submission.id),
            other => panic!("expected ack, got {:?}", other),
        }
        match committed.recv().await.unwrap() {
            ServerMessage::Committed { delta, .. } => {
                assert_eq!(delta.id, submission.id);
                assert!(delta.verify().unwrap());
            }
            other => panic!("expected committed delta, got {:?}", other),
        }

        let (snapshot, version) = handle.snapshot().await.unwrap();
        assert_eq!(Document::from_operation(&snapshot).unwrap().text(), "hi");
        assert_eq!(version.version(), 1);
    }

    #[tokio::test]
    async fn test_session_follows_broadcast_then_reply() {
        let mut hub = DocumentHub::new(ServerConfig::default());
        let handle = hub.document("notes");
        let mut committed = handle.subscribe();

        let (snapshot, version) = handle.snapshot().await.unwrap();
        let mut session = ClientSession::new(
            "notes",
            "alice",
            Document::from_operation(&snapshot).unwrap(),
            version,
            SessionConfig::default(),
        );
        session.local_edit(&insert_at(0, 0, "hi")).unwrap();
        let message = session.outgoing_message(0).unwrap().unwrap();

        let reply = handle.send(message).await.unwrap();
        // The task publishes the commit before it answers the sender
        session.handle(committed.recv().await.unwrap()).unwrap();
        session.handle(reply).unwrap();

        assert!(session.is_settled());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.server_version().version(), 1);
        assert_eq!(session.document().text(), "hi");
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let mut hub = DocumentHub::new(ServerConfig::default());
        let a = hub.document("a");
        let again = hub.document("a");
        let b = hub.document("b");
        assert_eq!(hub.len(), 2);

        let (_, v0) = a.snapshot().await.unwrap();
        again
            .send(ClientMessage::Submit {
                document_id: "a".into(),
                delta: DeltaSubmission::new("alice", v0, insert_at(0, 0, "x")),
            })
            .await
            .unwrap();

        assert_eq!(a.snapshot().await.unwrap().1.version(), 1);
        assert_eq!(b.snapshot().await.unwrap().1.version(), 0);
    }

    #[tokio::test]
    async fn test_wrong_document_rejected() {
        let mut hub = DocumentHub::new(ServerConfig::default());
        let handle = hub.document("a");
        let err = handle
            .send(ClientMessage::Open {
                document_id: "b".into(),
                version: HashedVersion::unsigned(0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_open_unknown_version_resyncs() {
        let mut hub = DocumentHub::new(ServerConfig::default());
        let reply = hub
            .route(ClientMessage::Open {
                document_id: "a".into(),
                version: HashedVersion::unsigned(4),
            })
            .await
            .unwrap();
        assert!(matches!(reply, ServerMessage::ResyncRequired { .. }));
    }
}
