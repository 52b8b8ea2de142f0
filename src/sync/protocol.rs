//! Wire protocol for document synchronization.
//!
//! Four message kinds over a message-oriented transport (websocket text
//! frames, JSON-encoded): the two handshake steps, steady-state operation
//! updates, and awareness. Every message is self-describing (operations carry
//! their full causal metadata), so no ordering between message kinds is
//! required, only eventual delivery.

use serde::{Deserialize, Serialize};

use crate::crdt::{Operation, StateVector};
use crate::presence::PresenceRecord;

/// A protocol message, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Handshake step 1: announce what this side has seen.
    SyncStep1 { doc: String, vector: StateVector },
    /// Handshake step 2: the operations the peer lacks per its announced
    /// vector.
    SyncStep2 { doc: String, ops: Vec<Operation> },
    /// Steady state: one freshly produced operation.
    Update { doc: String, op: Operation },
    /// Ephemeral presence, relayed best-effort and never persisted.
    Awareness { doc: String, record: PresenceRecord },
}

impl WireMessage {
    /// Encodes the message as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The document this message belongs to.
    pub fn doc_id(&self) -> &str {
        match self {
            WireMessage::SyncStep1 { doc, .. }
            | WireMessage::SyncStep2 { doc, .. }
            | WireMessage::Update { doc, .. }
            | WireMessage::Awareness { doc, .. } => doc,
        }
    }
}
