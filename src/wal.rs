//! Durable append-only log of sequenced orders.
//!
//! One JSON record per line, fsynced before `append` returns, so every
//! acknowledged record survives a process crash. Replay tolerates a torn
//! trailing line (a crash mid-append) and rejects anything else that is
//! structurally or sequentially invalid.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ids::{NodeId, Seq};
use crate::proto::OrderRecord;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("non-monotonic sequence at line {line}: expected {expected}, got {got}")]
    NonMonotonic { line: usize, expected: Seq, got: Seq },
}

/// Single-writer order log, identity-scoped to one peer.
pub struct OrderWal {
    path: PathBuf,
    file: File,
}

impl OrderWal {
    pub fn open(dir: &Path, node_id: NodeId) -> Result<Self, WalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("ordercast-{node_id}.wal"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Returns only after the bytes are durably on disk.
    pub fn append(&mut self, record: &OrderRecord) -> Result<(), WalError> {
        let mut line = serde_json::to_vec(record).map_err(WalError::Encode)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replays every record in append order.
    ///
    /// A torn trailing record (unterminated line, or an unparsable final
    /// line) is discarded. Sequence numbers must be dense starting at 1;
    /// anything else means the log cannot be trusted and the peer must
    /// refuse to start.
    pub fn replay(&self) -> Result<Vec<OrderRecord>, WalError> {
        let bytes = fs::read(&self.path)?;
        replay_bytes(&bytes)
    }
}

fn replay_bytes(bytes: &[u8]) -> Result<Vec<OrderRecord>, WalError> {
    let mut records = Vec::new();
    let mut chunks = bytes.split(|b| *b == b'\n').enumerate().peekable();

    while let Some((index, chunk)) = chunks.next() {
        let last = chunks.peek().is_none();
        // split() yields one empty tail chunk when the data ends in '\n'.
        if last && !chunk.is_empty() {
            tracing::debug!(line = index + 1, "discarding torn trailing wal record");
            break;
        }
        if chunk.is_empty() {
            continue;
        }

        let record: OrderRecord = match serde_json::from_slice(chunk) {
            Ok(record) => record,
            Err(err) => {
                // A final terminated-but-unparsable line is still a torn tail:
                // nothing was appended after it, so nothing depends on it.
                if chunks.clone().all(|(_, rest)| rest.is_empty()) {
                    tracing::debug!(line = index + 1, "discarding torn trailing wal record");
                    break;
                }
                return Err(WalError::Corrupt {
                    line: index + 1,
                    reason: err.to_string(),
                });
            }
        };

        let expected = Seq::new(records.len() as u64 + 1);
        if record.seq != expected {
            return Err(WalError::NonMonotonic {
                line: index + 1,
                expected,
                got: record.seq,
            });
        }
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::ids::{Epoch, PayloadId};

    fn record(seq: u64) -> OrderRecord {
        OrderRecord {
            epoch: Epoch::new(1),
            seq: Seq::new(seq),
            payload_id: PayloadId::new(format!("payload-{seq}")),
            submitter_id: NodeId::new(2),
            submitted_at_ms: 1_700_000_000_000 + seq,
            body: format!("order {seq}"),
        }
    }

    #[test]
    fn append_then_replay_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mut wal = OrderWal::open(dir.path(), NodeId::new(10)).unwrap();

        for seq in 1..=3 {
            wal.append(&record(seq)).unwrap();
        }

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[2], record(3));
    }

    #[test]
    fn replay_of_fresh_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let wal = OrderWal::open(dir.path(), NodeId::new(10)).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn torn_trailing_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let mut wal = OrderWal::open(dir.path(), NodeId::new(10)).unwrap();
        wal.append(&record(1)).unwrap();
        wal.append(&record(2)).unwrap();

        // Simulate a crash mid-append: a partial line with no newline.
        let mut bytes = fs::read(wal.path()).unwrap();
        bytes.extend_from_slice(b"{\"epoch\":1,\"seq\":3,\"pa");
        fs::write(wal.path(), &bytes).unwrap();

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].seq, Seq::new(2));
    }

    #[test]
    fn corrupt_interior_record_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut wal = OrderWal::open(dir.path(), NodeId::new(10)).unwrap();
        wal.append(&record(1)).unwrap();
        wal.append(&record(2)).unwrap();

        let bytes = fs::read(wal.path()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        lines[0] = "garbage";
        fs::write(wal.path(), format!("{}\n", lines.join("\n"))).unwrap();

        assert!(matches!(
            wal.replay().unwrap_err(),
            WalError::Corrupt { line: 1, .. }
        ));
    }

    #[test]
    fn gap_in_sequence_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut wal = OrderWal::open(dir.path(), NodeId::new(10)).unwrap();
        wal.append(&record(1)).unwrap();
        wal.append(&record(3)).unwrap();

        assert!(matches!(
            wal.replay().unwrap_err(),
            WalError::NonMonotonic { line: 2, .. }
        ));
    }
}
