//! Local durable store: snapshot plus append-only operation log.
//!
//! Layout inside the store directory:
//!
//! - `snapshot.json`: the latest full [`DocSnapshot`], replaced atomically
//!   (temp file + rename).
//! - `oplog.jsonl`: one JSON-encoded operation per line, appended and flushed
//!   as operations are applied.
//!
//! On startup the engine loads the snapshot and replays the trailing log to
//! reconstruct document state before accepting new local edits. Replay is
//! idempotent, so a crash between flush and snapshot never corrupts state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::crdt::{DocSnapshot, Operation};
use crate::error::StoreError;

const SNAPSHOT_FILE: &str = "snapshot.json";
const OPLOG_FILE: &str = "oplog.jsonl";

/// A directory-scoped durable store for one document replica.
///
/// The store holds its log file handle open for the engine's lifetime and
/// flushes on every append and on drop.
pub struct DocStore {
    dir: PathBuf,
    log: BufWriter<File>,
}

impl DocStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(OPLOG_FILE))?;
        Ok(DocStore {
            dir,
            log: BufWriter::new(log),
        })
    }

    /// Appends one operation to the log and flushes it to the OS.
    pub fn persist(&mut self, op: &Operation) -> Result<(), StoreError> {
        let line = serde_json::to_string(op)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.log.write_all(line.as_bytes())?;
        self.log.write_all(b"\n")?;
        self.log.flush()?;
        Ok(())
    }

    /// Loads the latest snapshot, if one has been written.
    pub fn load_snapshot(&self) -> Result<Option<DocSnapshot>, StoreError> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let snapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(snapshot))
    }

    /// Loads the trailing operation log in append order.
    ///
    /// A torn final line (crash mid-append) is skipped with a warning rather
    /// than failing the whole load; any earlier undecodable line means real
    /// corruption and errors out.
    pub fn load_log(&self) -> Result<Vec<Operation>, StoreError> {
        let path = self.dir.join(OPLOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;

        let mut ops = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Operation>(line) {
                Ok(op) => ops.push(op),
                Err(e) if i == last => {
                    warn!(error = %e, "skipping torn final log line");
                }
                Err(e) => return Err(StoreError::Corrupt(e.to_string())),
            }
        }
        Ok(ops)
    }

    /// Atomically replaces the snapshot and truncates the operation log.
    ///
    /// The snapshot is written to a temp file and renamed into place first, so
    /// a crash at any point leaves either the old or the new snapshot intact.
    pub fn write_snapshot(&mut self, snapshot: &DocSnapshot) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        let data = serde_json::to_vec(snapshot)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;

        // The snapshot now covers everything in the log.
        self.log.flush()?;
        let truncated = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(OPLOG_FILE))?;
        self.log = BufWriter::new(truncated);
        Ok(())
    }

    /// The directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DocStore {
    fn drop(&mut self) {
        if let Err(e) = self.log.flush() {
            warn!(error = %e, "failed to flush operation log on close");
        }
    }
}
