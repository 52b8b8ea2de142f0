//! Sync session: the per-connection protocol state machine.
//!
//! A session connects a local [`DocumentEngine`] to a relay hub over a
//! websocket. Lifecycle: `Connecting → Handshaking → Synced → Disconnected`,
//! with `Disconnected` retrying via capped exponential backoff with jitter.
//!
//! The handshake exchanges state vectors and deltas in both directions; the
//! session is `Synced` only after its own delta has been sent and the peer's
//! delta fully applied. In steady state every locally produced operation is
//! sent immediately and every received operation is merged. Disconnection
//! loses nothing: pending local operations are already persisted in the log
//! and go out as a fresh delta on the next handshake.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::engine::DocumentEngine;
use crate::error::TransportError;
use crate::presence::PresenceChannel;
use crate::sync::protocol::WireMessage;

/// Connection lifecycle state, observable by the UI as a connectivity
/// indicator. Local editing never blocks on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Synced,
    Disconnected,
}

/// Capped exponential backoff with jitter for reconnection attempts.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        ReconnectBackoff {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Next delay: `min(cap, base * 2^attempt)`, jittered into the upper half
    /// of the window so simultaneous reconnects spread out.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base * (1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
        capped.mul_f64(factor)
    }

    /// Resets after a successful `Synced` transition.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::new(Duration::from_millis(250), Duration::from_secs(30))
    }
}

/// A client-side sync session for one document.
pub struct SyncSession {
    url: String,
    doc_id: String,
    engine: Arc<DocumentEngine>,
    presence: Arc<PresenceChannel>,
    state_tx: watch::Sender<SessionState>,
    backoff: ReconnectBackoff,
    handshake_timeout: Duration,
}

impl SyncSession {
    /// Creates a session that will sync `engine` with the hub at `url`.
    /// Returns the session and a watch handle over its connection state.
    pub fn new(
        url: impl Into<String>,
        doc_id: impl Into<String>,
        engine: Arc<DocumentEngine>,
        presence: Arc<PresenceChannel>,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        (
            SyncSession {
                url: url.into(),
                doc_id: doc_id.into(),
                engine,
                presence,
                state_tx,
                backoff: ReconnectBackoff::default(),
                handshake_timeout: Duration::from_secs(10),
            },
            state_rx,
        )
    }

    /// Overrides the connect/handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Runs the session until the owning task is dropped or aborted. Every
    /// transport failure lands in `Disconnected` and retries with backoff.
    pub async fn run(mut self) {
        loop {
            self.set_state(SessionState::Connecting);
            let connected =
                timeout(self.handshake_timeout, connect_async(self.url.as_str())).await;
            match connected {
                Ok(Ok((ws, _))) => {
                    info!(doc = %self.doc_id, "connected to relay hub");
                    if let Err(e) = self.run_connection(ws).await {
                        warn!(doc = %self.doc_id, error = %e, "session interrupted");
                    }
                }
                Ok(Err(e)) => warn!(doc = %self.doc_id, error = %e, "connect failed"),
                Err(_) => warn!(doc = %self.doc_id, "connect timed out"),
            }
            self.set_state(SessionState::Disconnected);
            let delay = self.backoff.next_delay();
            debug!(doc = %self.doc_id, ?delay, "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    /// Handshake plus steady-state exchange over one connection.
    async fn run_connection(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<(), TransportError> {
        let (mut sink, mut stream) = ws.split();
        self.set_state(SessionState::Handshaking);

        // Subscribe before the handshake delta can be computed: an edit made
        // while the handshake is in flight may miss the delta, but it is in
        // the feed and still goes out once synced. The peer deduplicates.
        let mut changes = self.engine.subscribe();
        let (_, mut presence_rx) = self.presence.subscribe();

        self.send(&mut sink, self.step1()).await?;

        // Synced only once our delta went out and the peer's delta is applied.
        let mut sent_delta = false;
        let mut applied_delta = false;
        let deadline = Instant::now() + self.handshake_timeout;
        while !(sent_delta && applied_delta) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = timeout(remaining, stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?
                .ok_or(TransportError::Closed)??;
            match frame {
                WsMessage::Text(text) => match WireMessage::decode(&text)? {
                    WireMessage::SyncStep1 { vector, .. } => {
                        let ops = self.engine.delta_since(&vector);
                        debug!(doc = %self.doc_id, ops = ops.len(), "sending handshake delta");
                        let reply = WireMessage::SyncStep2 {
                            doc: self.doc_id.clone(),
                            ops,
                        };
                        self.send(&mut sink, reply).await?;
                        sent_delta = true;
                    }
                    WireMessage::SyncStep2 { ops, .. } => {
                        for op in ops {
                            self.apply_remote(op)?;
                        }
                        applied_delta = true;
                    }
                    other => self.handle_steady(other)?,
                },
                WsMessage::Ping(data) => sink.send(WsMessage::Pong(data)).await?,
                WsMessage::Close(_) => return Err(TransportError::Closed),
                _ => {}
            }
        }

        self.set_state(SessionState::Synced);
        self.backoff.reset();
        info!(doc = %self.doc_id, "synced");

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = frame.ok_or(TransportError::Closed)??;
                    match frame {
                        WsMessage::Text(text) => self.handle_steady(WireMessage::decode(&text)?)?,
                        WsMessage::Ping(data) => sink.send(WsMessage::Pong(data)).await?,
                        WsMessage::Close(_) => return Err(TransportError::Closed),
                        _ => {}
                    }
                }
                change = changes.recv() => {
                    match change {
                        Ok(notice) if notice.local => {
                            for op in notice.ops {
                                let msg = WireMessage::Update {
                                    doc: self.doc_id.clone(),
                                    op,
                                };
                                self.send(&mut sink, msg).await?;
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // Fell behind the local edit stream: the log still
                            // has everything, so force a fresh handshake.
                            warn!(doc = %self.doc_id, skipped = n, "change stream lagged");
                            return Err(TransportError::Desynchronized);
                        }
                        Err(_) => return Ok(()),
                    }
                }
                update = presence_rx.recv() => {
                    if let Ok(update) = update {
                        if !update.remote {
                            let msg = WireMessage::Awareness {
                                doc: self.doc_id.clone(),
                                record: update.record,
                            };
                            self.send(&mut sink, msg).await?;
                        }
                    }
                }
            }
        }
    }

    /// Applies a message received after the handshake. A resync request from
    /// the peer cannot be honored in place (the two sides would trade step-1s
    /// without ever applying a delta), so it tears the connection down; the
    /// reconnect handshake is the recovery path and loses nothing. Likewise an
    /// unresolvable operation means this session must re-handshake.
    fn handle_steady(&self, msg: WireMessage) -> Result<(), TransportError> {
        match msg {
            WireMessage::SyncStep1 { .. } => {
                warn!(doc = %self.doc_id, "peer requested resync, reconnecting");
                Err(TransportError::Desynchronized)
            }
            WireMessage::SyncStep2 { ops, .. } => {
                for op in ops {
                    self.apply_remote(op)?;
                }
                Ok(())
            }
            WireMessage::Update { op, .. } => self.apply_remote(op),
            WireMessage::Awareness { record, .. } => {
                self.presence.apply_remote(record);
                Ok(())
            }
        }
    }

    fn apply_remote(&self, op: crate::crdt::Operation) -> Result<(), TransportError> {
        self.engine
            .apply_remote(op)
            .map(|_| ())
            .map_err(|e| {
                warn!(doc = %self.doc_id, error = %e, "remote operation failed");
                TransportError::Desynchronized
            })
    }

    fn step1(&self) -> WireMessage {
        WireMessage::SyncStep1 {
            doc: self.doc_id.clone(),
            vector: self.engine.state_vector(),
        }
    }

    async fn send<S>(&self, sink: &mut S, msg: WireMessage) -> Result<(), TransportError>
    where
        S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let text = msg.encode()?;
        sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(2));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50));
        assert!(first <= Duration::from_millis(100));

        // Burn through attempts; the delay must never exceed the cap.
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(2));
        }
        assert!(backoff.attempt() > 0);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    #[test]
    fn test_session_starts_disconnected() {
        let engine = Arc::new(DocumentEngine::new(1));
        let presence = Arc::new(PresenceChannel::new());
        let (_session, state) = SyncSession::new("ws://localhost:1234/ws/doc", "doc", engine, presence);
        assert_eq!(*state.borrow(), SessionState::Disconnected);
    }

    #[test]
    fn test_steady_resync_request_tears_down() {
        let engine = Arc::new(DocumentEngine::new(1));
        let presence = Arc::new(PresenceChannel::new());
        let (session, _state) =
            SyncSession::new("ws://localhost:1234/ws/doc", "doc", engine, presence);

        // A step 1 after the handshake cannot be answered in place without
        // the two sides trading step 1s forever; it must force a reconnect.
        let resync = WireMessage::SyncStep1 {
            doc: "doc".into(),
            vector: crate::crdt::StateVector::new(),
        };
        assert!(matches!(
            session.handle_steady(resync),
            Err(TransportError::Desynchronized)
        ));
    }

    #[test]
    fn test_steady_delta_is_applied() {
        let source = DocumentEngine::new(2);
        let ops = source.insert(0, "ab").unwrap();

        let engine = Arc::new(DocumentEngine::new(1));
        let presence = Arc::new(PresenceChannel::new());
        let (session, _state) =
            SyncSession::new("ws://localhost:1234/ws/doc", "doc", engine.clone(), presence);

        let delta = WireMessage::SyncStep2 {
            doc: "doc".into(),
            ops,
        };
        session.handle_steady(delta).unwrap();
        assert_eq!(engine.text(), "ab");
    }
}
