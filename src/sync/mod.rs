//! Concurrency control
//!
//! Clients edit optimistically and send deltas against the last server
//! version they know. The server commits deltas in one total order per
//! document, transforming late arrivals across whatever was committed in the
//! meantime, and every participant converges on the same document.

pub mod client;
pub mod delta;
pub mod history;
#[cfg(feature = "hub")]
pub mod hub;
pub mod server;
pub mod version;

pub use client::{ClientSession, PendingDelta, PendingState, SessionState};
pub use delta::{Ack, Delta, DeltaId, DeltaSubmission};
pub use history::{DeltaHistory, InMemoryDeltaHistory};
#[cfg(feature = "hub")]
pub use hub::{DocumentHandle, DocumentHub};
pub use server::{DocumentServer, Opened, Submitted};
pub use version::{HashedVersion, HASH_LEN};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, SessionConfig};
    use crate::document::Document;
    use crate::ot::tests::{random_document, random_operation, Tape};
    use crate::ot::{Operation, OperationBuilder};
    use crate::protocol::{ClientMessage, ServerMessage};
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn insert_at(pos: usize, len: usize, text: &str) -> Operation {
        let mut b = OperationBuilder::new();
        b.retain(pos).insert_characters(text).retain(len - pos);
        b.build()
    }

    fn seeded(document: &Document) -> DocumentServer {
        let mut server = DocumentServer::new("doc", ServerConfig::default());
        if !document.is_empty() {
            let v0 = server.current_version();
            server
                .submit(DeltaSubmission::new("seed", v0, document.to_operation()), 0)
                .unwrap();
        }
        server
    }

    fn join(server: &DocumentServer, who: &str) -> ClientSession {
        let (snapshot, version) = server.snapshot();
        ClientSession::new(
            "doc",
            who,
            Document::from_operation(&snapshot).unwrap(),
            version,
            SessionConfig::default(),
        )
    }

    /// Clients wired to one server through in-order message queues
    struct Network {
        server: DocumentServer,
        clients: Vec<ClientSession>,
        to_server: VecDeque<(usize, ClientMessage)>,
        to_client: Vec<VecDeque<ServerMessage>>,
        clock: i64,
    }

    impl Network {
        fn new(document: &Document, participants: usize) -> Self {
            let server = seeded(document);
            let clients = (0..participants)
                .map(|i| join(&server, &format!("client-{}", i)))
                .collect();
            Self {
                server,
                clients,
                to_server: VecDeque::new(),
                to_client: vec![VecDeque::new(); participants],
                clock: 0,
            }
        }

        fn send(&mut self, who: usize) {
            self.clock += 1;
            if let Some(message) = self.clients[who].outgoing_message(self.clock).unwrap() {
                self.to_server.push_back((who, message));
            }
        }

        fn serve_one(&mut self) -> bool {
            let Some((from, message)) = self.to_server.pop_front() else {
                return false;
            };
            self.clock += 1;
            let (reply, broadcast) = self.server.handle(message, self.clock);
            self.to_client[from].push_back(reply);
            if let Some(broadcast) = broadcast {
                for (who, queue) in self.to_client.iter_mut().enumerate() {
                    if who != from {
                        queue.push_back(broadcast.clone());
                    }
                }
            }
            true
        }

        fn deliver_one(&mut self, who: usize) -> bool {
            let Some(message) = self.to_client[who].pop_front() else {
                return false;
            };
            self.clients[who].handle(message).unwrap();
            true
        }

        fn settle(&mut self) {
            loop {
                for who in 0..self.clients.len() {
                    self.send(who);
                }
                let mut moved = false;
                while self.serve_one() {
                    moved = true;
                }
                for who in 0..self.clients.len() {
                    while self.deliver_one(who) {
                        moved = true;
                    }
                }
                if !moved {
                    break;
                }
            }
        }
    }

    #[test]
    fn test_concurrent_insert_and_delete() {
        // "AB": alice inserts X after A while bob deletes A
        let mut net = Network::new(&Document::new().apply(&insert_at(0, 0, "AB")).unwrap(), 2);

        net.clients[0].local_edit(&insert_at(1, 2, "X")).unwrap();
        let mut b = OperationBuilder::new();
        b.delete_characters("A").retain(1);
        net.clients[1].local_edit(&b.build()).unwrap();

        net.send(1);
        net.send(0);
        net.settle();

        assert_eq!(net.server.document().text(), "XB");
        for client in &net.clients {
            assert_eq!(client.document().text(), "XB");
            assert!(client.is_settled());
            assert_eq!(client.server_version(), &net.server.current_version());
        }
    }

    #[test]
    fn test_history_lookup_by_version() {
        let mut server = DocumentServer::new("doc", ServerConfig::default());
        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            let base = server.current_version();
            server
                .submit(DeltaSubmission::new("alice", base, insert_at(i, i, text)), i as i64)
                .unwrap();
        }
        assert_eq!(server.current_version().version(), 3);

        let delta = server.history().delta_starting_at(1).unwrap();
        assert_eq!(delta.base_version.version(), 1);
        assert_eq!(delta.resulting_version.version(), 2);
        assert_eq!(delta.operation, insert_at(1, 1, "b"));
        assert!(server.history().delta_starting_at(5).is_none());
    }

    #[test]
    fn test_forged_version_forces_resync() {
        let mut net = Network::new(&Document::new().apply(&insert_at(0, 0, "abc")).unwrap(), 1);
        let honest = net.server.current_version();
        let forged = HashedVersion::new(honest.version(), vec![0; HASH_LEN]);

        let (reply, broadcast) = net.server.handle(
            ClientMessage::Submit {
                document_id: "doc".into(),
                delta: DeltaSubmission::new("mallory", forged, insert_at(0, 3, "!")),
            },
            1,
        );

        assert!(broadcast.is_none());
        match reply {
            ServerMessage::ResyncRequired { version, .. } => assert_eq!(version, honest),
            other => panic!("expected resync, got {:?}", other),
        }
        assert_eq!(net.server.document().text(), "abc");
        assert_eq!(net.server.current_version(), honest);
    }

    #[test]
    fn test_three_clients_converge() {
        let mut net = Network::new(&Document::new().apply(&insert_at(0, 0, "hello")).unwrap(), 3);

        net.clients[0].local_edit(&insert_at(0, 5, ">")).unwrap();
        net.clients[1].local_edit(&insert_at(5, 5, "!")).unwrap();
        let mut b = OperationBuilder::new();
        b.retain(1).delete_characters("ell").retain(1);
        net.clients[2].local_edit(&b.build()).unwrap();

        for who in [2, 0, 1] {
            net.send(who);
        }
        // Client 1 edits again before hearing from anyone
        net.clients[1].local_edit(&insert_at(6, 6, "?")).unwrap();
        net.settle();

        let expected = net.server.document().clone();
        assert_eq!(expected.text(), ">ho!?");
        for client in &net.clients {
            assert_eq!(client.document(), &expected);
        }
    }

    #[test]
    fn test_reconnect_after_missed_deltas() {
        let mut net = Network::new(&Document::new().apply(&insert_at(0, 0, "ab")).unwrap(), 2);
        net.clients[1].disconnect();

        net.clients[0].local_edit(&insert_at(2, 2, "c")).unwrap();
        net.send(0);
        net.serve_one();
        net.deliver_one(0);
        // Client 1 was offline; drop what was pushed to it and edit locally
        net.to_client[1].clear();
        net.clients[1].local_edit(&insert_at(0, 2, "z")).unwrap();

        let open = net.clients[1].reconnect_message();
        let (reply, _) = net.server.handle(open, 10);
        net.clients[1].handle(reply).unwrap();
        net.settle();

        assert_eq!(net.server.document().text(), "zabc");
        assert_eq!(net.clients[0].document().text(), "zabc");
        assert_eq!(net.clients[1].document().text(), "zabc");
    }

    proptest! {
        /// Any interleaving of edits, sends and deliveries converges
        #[test]
        fn prop_clients_converge(
            d in prop::collection::vec(any::<u8>(), 0..48),
            edits in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..8),
            schedule in prop::collection::vec(any::<u8>(), 0..48),
        ) {
            let mut net = Network::new(&random_document(&mut Tape::new(&d)), 3);
            let mut edits = edits.iter();

            for step in schedule {
                let who = (step as usize / 4) % 3;
                match step % 4 {
                    0 => {
                        if let Some(tape) = edits.next() {
                            let op = random_operation(net.clients[who].document(), &mut Tape::new(tape));
                            net.clients[who].local_edit(&op).unwrap();
                        }
                    }
                    1 => net.send(who),
                    2 => {
                        net.serve_one();
                    }
                    _ => {
                        net.deliver_one(who);
                    }
                }
            }
            net.settle();

            let expected = net.server.document().clone();
            for client in &net.clients {
                prop_assert_eq!(client.document(), &expected);
                prop_assert!(client.is_settled());
            }
        }
    }
}
