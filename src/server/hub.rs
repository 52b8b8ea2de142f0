//! Relay hub: per-document rooms that fan out operations between sessions.
//!
//! The hub holds no document business logic beyond fan-out plus an optional
//! merged engine per room (kept so late joiners can handshake against
//! server-side state, and optionally persisted for durability independent of
//! any single client). It trusts each operation's self-contained causal
//! metadata: a malformed operation can desync only the session that sent it.
//!
//! Each attached session gets an isolated bounded outgoing queue. A slow
//! session never blocks delivery to others; a session whose queue overflows is
//! dropped and must resynchronize with a fresh handshake rather than receive
//! partial or reordered data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::engine::DocumentEngine;
use crate::error::EngineError;
use crate::presence::PresenceChannel;
use crate::store::DocStore;
use crate::sync::protocol::WireMessage;

/// Replica id reserved for hub-side merged engines. Client sessions must use
/// nonzero replica ids; the hub never creates local operations.
pub const HUB_REPLICA_ID: u64 = 0;

/// Identifies one attached session within the hub.
pub type SessionId = u64;

/// Default per-session outgoing queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One document's room: attached sessions, merged state, and presence.
pub struct Room {
    doc_id: String,
    engine: DocumentEngine,
    presence: PresenceChannel,
    members: RwLock<HashMap<SessionId, mpsc::Sender<WireMessage>>>,
}

impl Room {
    fn new(doc_id: String, engine: DocumentEngine) -> Self {
        Room {
            doc_id,
            engine,
            presence: PresenceChannel::new(),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// The room's merged engine state.
    pub fn engine(&self) -> &DocumentEngine {
        &self.engine
    }

    /// The room's presence channel.
    pub fn presence(&self) -> &PresenceChannel {
        &self.presence
    }

    /// Number of currently attached sessions.
    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Processes one message from `from`, rebroadcasting to every other
    /// session in the room. Returns replies destined for the sender.
    pub fn handle_message(&self, from: SessionId, msg: WireMessage) -> Vec<WireMessage> {
        match msg {
            WireMessage::SyncStep1 { vector, .. } => {
                let ops = self.engine.delta_since(&vector);
                vec![
                    WireMessage::SyncStep1 {
                        doc: self.doc_id.clone(),
                        vector: self.engine.state_vector(),
                    },
                    WireMessage::SyncStep2 {
                        doc: self.doc_id.clone(),
                        ops,
                    },
                ]
            }
            WireMessage::SyncStep2 { ops, .. } => {
                for op in ops {
                    if let Some(reply) = self.merge_and_fanout(from, op) {
                        return vec![reply];
                    }
                }
                Vec::new()
            }
            WireMessage::Update { op, .. } => {
                self.merge_and_fanout(from, op).into_iter().collect()
            }
            WireMessage::Awareness { record, .. } => {
                if self.presence.apply_remote(record.clone()) {
                    self.broadcast(
                        &WireMessage::Awareness {
                            doc: self.doc_id.clone(),
                            record,
                        },
                        from,
                    );
                }
                Vec::new()
            }
        }
    }

    /// Merges one operation into the room engine and fans it out to every
    /// other session. A malformed operation yields a resync request for the
    /// sender instead; it cannot corrupt anyone else's state.
    fn merge_and_fanout(&self, from: SessionId, op: crate::crdt::Operation) -> Option<WireMessage> {
        match self.engine.apply_remote(op.clone()) {
            Ok(crate::crdt::ApplyOutcome::Duplicate) => None,
            Ok(_) => {
                self.broadcast(
                    &WireMessage::Update {
                        doc: self.doc_id.clone(),
                        op,
                    },
                    from,
                );
                None
            }
            Err(EngineError::Op(e)) => {
                warn!(doc = %self.doc_id, session = from, error = %e,
                    "malformed operation, requesting resync from sender");
                Some(WireMessage::SyncStep1 {
                    doc: self.doc_id.clone(),
                    vector: self.engine.state_vector(),
                })
            }
            Err(e) => {
                // Room state merged in memory is still authoritative; only the
                // durable copy is behind.
                error!(doc = %self.doc_id, error = %e, "failed to persist merged operation");
                self.broadcast(
                    &WireMessage::Update {
                        doc: self.doc_id.clone(),
                        op,
                    },
                    from,
                );
                None
            }
        }
    }

    /// Sends `msg` to every session except `excluding`. Sends are isolated:
    /// a full or closed queue drops that session alone.
    pub fn broadcast(&self, msg: &WireMessage, excluding: SessionId) {
        let mut dropped = Vec::new();
        {
            let members = self.members.read();
            for (id, tx) in members.iter() {
                if *id == excluding {
                    continue;
                }
                if tx.try_send(msg.clone()).is_err() {
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            let mut members = self.members.write();
            for id in dropped {
                members.remove(&id);
                warn!(doc = %self.doc_id, session = id,
                    "outgoing queue overflowed, dropping session for resync");
            }
        }
    }

    /// Queues a reply for one session. Errors mean the session is gone or
    /// hopelessly behind; it is removed and must re-handshake.
    pub fn send_to(&self, session: SessionId, msg: WireMessage) -> Result<(), ()> {
        let tx = self.members.read().get(&session).cloned();
        match tx {
            Some(tx) if tx.try_send(msg).is_ok() => Ok(()),
            Some(_) => {
                self.members.write().remove(&session);
                warn!(doc = %self.doc_id, session, "reply queue overflowed, dropping session");
                Err(())
            }
            None => Err(()),
        }
    }

    fn join(&self, session: SessionId, tx: mpsc::Sender<WireMessage>) {
        self.members.write().insert(session, tx);
    }

    fn leave(&self, session: SessionId) {
        self.members.write().remove(&session);
    }
}

/// The server-side fan-out process: one room per document.
pub struct RelayHub {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    queue_capacity: usize,
    persist_root: Option<PathBuf>,
    next_session: AtomicU64,
}

impl RelayHub {
    /// Creates a hub with in-memory rooms.
    pub fn new() -> Self {
        RelayHub {
            rooms: RwLock::new(HashMap::new()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            persist_root: None,
            next_session: AtomicU64::new(1),
        }
    }

    /// Persists each room's merged state under `root/<doc_id>/`.
    pub fn with_persistence(mut self, root: impl Into<PathBuf>) -> Self {
        self.persist_root = Some(root.into());
        self
    }

    /// Overrides the per-session outgoing queue depth.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Gets or creates the room for `doc_id`.
    pub fn room(&self, doc_id: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(doc_id) {
            return room.clone();
        }
        let mut rooms = self.rooms.write();
        rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| {
                info!(doc = %doc_id, "opening room");
                Arc::new(Room::new(doc_id.to_string(), self.open_engine(doc_id)))
            })
            .clone()
    }

    /// Attaches a session to a room, returning its id, the room, and the
    /// receiving end of its bounded outgoing queue.
    pub fn join(&self, doc_id: &str) -> (SessionId, Arc<Room>, mpsc::Receiver<WireMessage>) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let room = self.room(doc_id);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        room.join(session, tx);
        info!(doc = %doc_id, session, members = room.member_count(), "session joined");
        (session, room, rx)
    }

    /// Detaches a session from its room.
    pub fn leave(&self, doc_id: &str, session: SessionId) {
        if let Some(room) = self.rooms.read().get(doc_id) {
            room.leave(session);
            info!(doc = %doc_id, session, members = room.member_count(), "session left");
        }
    }

    /// Expires stale presence in every room. Run periodically.
    pub fn sweep_presence(&self) {
        let now = Utc::now();
        for room in self.rooms.read().values() {
            room.presence.sweep(now);
        }
    }

    fn open_engine(&self, doc_id: &str) -> DocumentEngine {
        if let Some(root) = &self.persist_root {
            match DocStore::open(root.join(doc_id))
                .and_then(|store| DocumentEngine::open(HUB_REPLICA_ID, store).map_err(|e| match e {
                    EngineError::Store(s) => s,
                    other => {
                        error!(doc = %doc_id, error = %other, "room state replay failed");
                        crate::error::StoreError::Corrupt(other.to_string())
                    }
                })) {
                Ok(engine) => return engine,
                Err(e) => {
                    error!(doc = %doc_id, error = %e,
                        "room store unavailable, falling back to in-memory state");
                }
            }
        }
        DocumentEngine::new(HUB_REPLICA_ID)
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Doc;

    fn drain(rx: &mut mpsc::Receiver<WireMessage>) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_handshake_against_room_state() {
        let hub = RelayHub::new();
        let (s1, room, _rx1) = hub.join("notes");

        // Seed the room through a client delta.
        let mut doc = Doc::new(1);
        doc.local_insert(0, 'h');
        doc.local_insert(1, 'i');
        let step2 = WireMessage::SyncStep2 {
            doc: "notes".into(),
            ops: doc.history_ops(),
        };
        assert!(room.handle_message(s1, step2).is_empty());
        assert_eq!(room.engine().text(), "hi");

        // A late joiner handshakes and receives the full delta.
        let (s2, room2, _rx2) = hub.join("notes");
        let replies = room2.handle_message(
            s2,
            WireMessage::SyncStep1 {
                doc: "notes".into(),
                vector: crate::crdt::StateVector::new(),
            },
        );
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            WireMessage::SyncStep2 { ops, .. } => assert_eq!(ops.len(), 2),
            other => panic!("expected SyncStep2, got {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let hub = RelayHub::new();
        let (s1, room, mut rx1) = hub.join("notes");
        let (s2, _, mut rx2) = hub.join("notes");
        let (_s3, _, mut rx3) = hub.join("notes");

        let mut doc = Doc::new(1);
        let op = doc.local_insert(0, 'x');
        room.handle_message(s1, WireMessage::Update {
            doc: "notes".into(),
            op,
        });

        assert!(drain(&mut rx1).is_empty());
        assert_eq!(drain(&mut rx2).len(), 1);
        assert_eq!(drain(&mut rx3).len(), 1);

        // Duplicate redelivery is not rebroadcast.
        let mut doc2 = Doc::new(1);
        let op = doc2.local_insert(0, 'x');
        room.handle_message(s2, WireMessage::Update {
            doc: "notes".into(),
            op,
        });
        assert!(drain(&mut rx1).is_empty());
    }

    #[test]
    fn test_slow_session_is_dropped_not_blocking() {
        let hub = RelayHub::new().with_queue_capacity(2);
        let (s1, room, _rx1) = hub.join("notes");
        let (_s2, _, _rx2_kept_full) = hub.join("notes");
        let (_s3, _, mut rx3) = hub.join("notes");
        assert_eq!(room.member_count(), 3);

        // Session 3 drains its queue between messages; session 2 never does.
        let mut doc = Doc::new(1);
        let mut received = 0;
        for i in 0..4 {
            let op = doc.local_insert(i, 'a');
            room.handle_message(s1, WireMessage::Update {
                doc: "notes".into(),
                op,
            });
            received += drain(&mut rx3).len();
        }

        // Session 2 overflowed its queue of 2 and got dropped; session 3 kept
        // receiving everything.
        assert_eq!(room.member_count(), 2);
        assert_eq!(received, 4);
    }

    #[test]
    fn test_malformed_operation_triggers_sender_resync() {
        let hub = RelayHub::new();
        let (s1, room, _rx1) = hub.join("notes");
        let (_s2, _, mut rx2) = hub.join("notes");

        let bad = WireMessage::Update {
            doc: "notes".into(),
            op: crate::crdt::Operation::Insert {
                id: crate::crdt::OpId::new(7, 0),
                origin_left: None,
                origin_right: None,
                content: 'z',
            },
        };
        let replies = room.handle_message(s1, bad);
        assert!(matches!(replies[0], WireMessage::SyncStep1 { .. }));
        // Nothing was fanned out to the other session.
        assert!(drain(&mut rx2).is_empty());
    }

    #[test]
    fn test_leave_removes_member() {
        let hub = RelayHub::new();
        let (s1, room, _rx) = hub.join("notes");
        assert_eq!(room.member_count(), 1);
        hub.leave("notes", s1);
        assert_eq!(room.member_count(), 0);
    }
}
