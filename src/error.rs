//! Error taxonomy for the synchronization engine.
//!
//! Three failure domains, handled differently: `OpError` is a protocol-level
//! violation (the session that produced it resynchronizes), `StoreError` is a
//! local I/O failure (retried with backoff at the call site), and
//! `TransportError` is a connection problem (absorbed entirely by the sync
//! session's reconnect state machine).

use thiserror::Error;

use crate::crdt::types::OpId;

/// A malformed or unresolvable operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// The operation references an id that can never resolve: a zero sequence
    /// number, a reference to the operation's own future, or an id that was
    /// applied but never created an element. This is a protocol violation, not
    /// a normal delivery race (those are buffered, not rejected).
    #[error("operation {op} references id {missing} which can never resolve")]
    UnknownReplica { op: OpId, missing: OpId },
}

/// Durable store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure. The engine retries these with backoff
    /// before surfacing them; a lost local operation would break causal
    /// delivery to peers.
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    /// The on-disk snapshot or log could not be decoded.
    #[error("store contents corrupt: {0}")]
    Corrupt(String),
}

/// Umbrella error at the document engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Op(#[from] OpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A local edit addressed a position outside the visible sequence.
    #[error("position {0} is out of bounds")]
    PositionOutOfBounds(usize),
}

/// Connection-level failure, handled by the sync session state machine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket failure: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    /// The peer sent something that desynchronized this session; a fresh
    /// handshake is required.
    #[error("session desynchronized, full resync required")]
    Desynchronized,
    #[error("malformed wire message: {0}")]
    Protocol(#[from] serde_json::Error),
}
