//! Document engine: one open document, owned explicitly by whoever opened it.
//!
//! The engine wires the sequence CRDT, the operation log, and the optional
//! durable store behind a single handle. Mutation of document state is a
//! critical section (writers exclusive); `text()` and other reads may run
//! concurrently with each other. The store lives behind its own lock: CRDT
//! application never blocks on I/O, and a retried append stalls only other
//! appends, never readers or in-memory merges.
//!
//! Observers (the editing surface, sync sessions) subscribe to change
//! notifications; they never mutate document state directly.

use std::ops::Range;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::crdt::{ApplyOutcome, Doc, DocSnapshot, OpLog, Operation, ReplicaId, StateVector};
use crate::error::EngineError;
use crate::store::DocStore;

/// Persist retries before a local edit is refused.
const PERSIST_ATTEMPTS: u32 = 4;
const PERSIST_BASE_DELAY: Duration = Duration::from_millis(10);

/// A change applied to the document, delivered to observers.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// True if the operations originated from this replica's own edits. Sync
    /// sessions forward only local changes; remote ones arrived over the wire.
    pub local: bool,
    /// The operations applied, in application order.
    pub ops: Vec<Operation>,
}

struct EngineInner {
    doc: Doc,
    log: OpLog,
}

impl EngineInner {
    /// Records integrated operations in the in-memory log.
    fn commit(&mut self, ops: &[Operation]) {
        for op in ops {
            self.log.append(op);
        }
    }
}

/// Handle to one open, replicated document.
pub struct DocumentEngine {
    inner: RwLock<EngineInner>,
    store: Option<Mutex<DocStore>>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl DocumentEngine {
    /// Creates an in-memory engine (no durable store) for `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        let (changes, _) = broadcast::channel(256);
        DocumentEngine {
            inner: RwLock::new(EngineInner {
                doc: Doc::new(replica),
                log: OpLog::new(),
            }),
            store: None,
            changes,
        }
    }

    /// Opens an engine backed by `store`, reconstructing document state from
    /// the latest snapshot plus the trailing operation log before any new
    /// edits are accepted. Replay is deterministic and idempotent.
    pub fn open(replica: ReplicaId, store: DocStore) -> Result<Self, EngineError> {
        let mut doc = match store.load_snapshot()? {
            Some(snapshot) => Doc::from_snapshot(replica, snapshot),
            None => Doc::new(replica),
        };
        let mut log = OpLog::new();
        log.rebuild_from(doc.history_ops());

        let trailing = store.load_log()?;
        debug!(ops = trailing.len(), "replaying trailing operation log");
        for op in trailing {
            let result = doc.apply(op)?;
            for applied in &result.applied {
                log.append(applied);
            }
        }
        // Replay advances the vector but not the local counter; resume it so
        // the first post-restart edit does not reuse an id.
        doc.resume_local_seq();

        let (changes, _) = broadcast::channel(256);
        Ok(DocumentEngine {
            inner: RwLock::new(EngineInner { doc, log }),
            store: Some(Mutex::new(store)),
            changes,
        })
    }

    /// This replica's id.
    pub fn replica_id(&self) -> ReplicaId {
        self.inner.read().doc.replica_id()
    }

    /// The current visible sequence as text.
    pub fn text(&self) -> String {
        self.inner.read().doc.text()
    }

    /// The current state vector.
    pub fn state_vector(&self) -> StateVector {
        self.inner.read().doc.vector().clone()
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }

    /// Inserts `text` at visible `position`, persisting each resulting
    /// operation before returning. The returned operations are also delivered
    /// to subscribers as a local change.
    pub fn insert(&self, position: usize, text: &str) -> Result<Vec<Operation>, EngineError> {
        let ops = {
            let mut inner = self.inner.write();
            if position > inner.doc.visible_len() {
                return Err(EngineError::PositionOutOfBounds(position));
            }
            let mut ops = Vec::new();
            for (offset, ch) in text.chars().enumerate() {
                ops.push(inner.doc.local_insert(position + offset, ch));
            }
            inner.commit(&ops);
            ops
        };
        self.persist_all(&ops)?;
        self.notify(true, ops.clone());
        Ok(ops)
    }

    /// Deletes the visible `range`, persisting each resulting operation.
    pub fn delete(&self, range: Range<usize>) -> Result<Vec<Operation>, EngineError> {
        let ops = {
            let mut inner = self.inner.write();
            if range.end > inner.doc.visible_len() || range.start > range.end {
                return Err(EngineError::PositionOutOfBounds(range.end));
            }
            let ops = inner.doc.local_delete(range);
            inner.commit(&ops);
            ops
        };
        self.persist_all(&ops)?;
        self.notify(true, ops.clone());
        Ok(ops)
    }

    /// Applies an operation received from a peer. Anything actually integrated
    /// (the operation plus any drained buffered ones) is logged, persisted, and
    /// delivered to subscribers as a remote change.
    pub fn apply_remote(&self, op: Operation) -> Result<ApplyOutcome, EngineError> {
        let (outcome, applied) = {
            let mut inner = self.inner.write();
            let result = inner.doc.apply(op)?;
            inner.commit(&result.applied);
            (result.outcome, result.applied)
        };
        self.persist_all(&applied)?;
        if !applied.is_empty() {
            self.notify(false, applied);
        }
        Ok(outcome)
    }

    /// Persists integrated operations, retrying transient I/O failures with
    /// backoff. Runs outside the document lock; only other persists wait. A
    /// final failure is surfaced, never silently dropped: the operation is
    /// still in memory and in outgoing deltas, but the caller must know the
    /// durable copy is behind.
    fn persist_all(&self, ops: &[Operation]) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut store = store.lock();
        for op in ops {
            let mut delay = PERSIST_BASE_DELAY;
            let mut attempt = 1;
            loop {
                match store.persist(op) {
                    Ok(()) => break,
                    Err(e) if attempt < PERSIST_ATTEMPTS => {
                        warn!(error = %e, attempt, "operation persist failed, retrying");
                        std::thread::sleep(delay);
                        delay *= 4;
                        attempt += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Operations the peer described by `peer` lacks. Exact when the peer's
    /// vector dominates the compaction floor; otherwise the delta is
    /// regenerated from full document state, filtered by the peer's vector.
    pub fn delta_since(&self, peer: &StateVector) -> Vec<Operation> {
        let inner = self.inner.read();
        if peer.dominates(inner.log.floor()) {
            inner.log.delta_since(peer)
        } else {
            inner
                .doc
                .history_ops()
                .into_iter()
                .filter(|op| !peer.observed(&op.id()))
                .collect()
        }
    }

    /// Captures the current document state.
    pub fn snapshot(&self) -> DocSnapshot {
        self.inner.read().doc.snapshot()
    }

    /// Compacts the in-memory log below `below` (the pointwise minimum of all
    /// known peer vectors) and, if a store is attached, checkpoints a snapshot
    /// and truncates the on-disk log. Advisory: affects storage only.
    pub fn compact(&self, below: &StateVector) -> Result<(), EngineError> {
        // Store lock taken first: appends are held off so no operation can
        // land between the snapshot being captured and the log truncating.
        let mut store = self.store.as_ref().map(|s| s.lock());
        let mut inner = self.inner.write();
        let EngineInner { doc, log } = &mut *inner;
        log.compact(below, doc);
        if let Some(store) = store.as_deref_mut() {
            store.write_snapshot(&doc.snapshot())?;
        }
        Ok(())
    }

    /// Number of operations buffered waiting for missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.inner.read().doc.pending_len()
    }

    fn notify(&self, local: bool, ops: Vec<Operation>) {
        // No subscribers is fine.
        let _ = self.changes.send(ChangeNotice { local, ops });
    }
}
