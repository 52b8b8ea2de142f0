//! Presence channel: ephemeral cursor/selection/user metadata.
//!
//! Presence is decoupled from document content: records are broadcast
//! best-effort, never persisted, and expire after a fixed timeout with no
//! refresh. Expiry is an explicit policy: a tracked last-seen timestamp and a
//! periodic sweep, so peers that disconnect without a clean close disappear
//! on their own.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default time after which a silent peer's presence is dropped.
pub const DEFAULT_PRESENCE_TTL_SECS: i64 = 30;

/// One participant's ephemeral state: cursor, selection, identity, whatever
/// the editing surface chooses to put in `payload`. Not part of document
/// state and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    /// Monotonic per-user counter; stale updates (lower seq) are ignored.
    pub ephemeral_seq: u64,
    pub payload: serde_json::Value,
    pub last_seen_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// Creates a record stamped with the current time.
    pub fn new(user_id: impl Into<String>, ephemeral_seq: u64, payload: serde_json::Value) -> Self {
        PresenceRecord {
            user_id: user_id.into(),
            ephemeral_seq,
            payload,
            last_seen_at: Utc::now(),
        }
    }
}

/// A presence update as seen by subscribers.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub record: PresenceRecord,
    /// True if the record arrived from a peer (as opposed to a local publish).
    /// Sync sessions forward only local updates, which keeps broadcast loops
    /// from echoing records back out.
    pub remote: bool,
}

/// In-process presence hub for one document.
///
/// A fresh subscription starts from the current snapshot, not history; the
/// live feed is an infinite stream that is not restartable.
pub struct PresenceChannel {
    ttl: Duration,
    states: RwLock<HashMap<String, PresenceRecord>>,
    tx: broadcast::Sender<PresenceUpdate>,
}

impl PresenceChannel {
    /// Creates a channel with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_PRESENCE_TTL_SECS))
    }

    /// Creates a channel that expires silent peers after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        PresenceChannel {
            ttl,
            states: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Publishes a locally produced record. Returns false if the record was
    /// stale (an equal or higher `ephemeral_seq` is already known).
    pub fn publish(&self, record: PresenceRecord) -> bool {
        self.accept(record, false)
    }

    /// Applies a record received from a peer.
    pub fn apply_remote(&self, record: PresenceRecord) -> bool {
        self.accept(record, true)
    }

    fn accept(&self, record: PresenceRecord, remote: bool) -> bool {
        {
            let mut states = self.states.write();
            if let Some(existing) = states.get(&record.user_id) {
                if existing.ephemeral_seq >= record.ephemeral_seq {
                    return false;
                }
            }
            states.insert(record.user_id.clone(), record.clone());
        }
        // Best-effort: no subscribers, no retry.
        let _ = self.tx.send(PresenceUpdate { record, remote });
        true
    }

    /// Current snapshot plus a live feed starting from now.
    pub fn subscribe(&self) -> (Vec<PresenceRecord>, broadcast::Receiver<PresenceUpdate>) {
        let states = self.states.read();
        let snapshot = states.values().cloned().collect();
        (snapshot, self.tx.subscribe())
    }

    /// Everyone currently present.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.states.read().values().cloned().collect()
    }

    /// Removes records not refreshed within the TTL as of `now`. Returns the
    /// user ids that expired.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut states = self.states.write();
        let expired: Vec<String> = states
            .iter()
            .filter(|(_, r)| now - r.last_seen_at > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            states.remove(id);
            debug!(user = %id, "presence expired");
        }
        expired
    }
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new()
    }
}
