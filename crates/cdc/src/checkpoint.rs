//! Resume-token persistence and checkpoint gating.
//!
//! The resume token is the byte position (LSN) of the last change whose
//! downstream effects are settled. `CheckpointGate` tracks in-flight flushes
//! so the token never advances past a change that is still buffered or
//! awaiting egress settlement.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use sync_core::{Error, Result};
use tracing::{debug, warn};

/// Parse a Postgres textual LSN (`X/Y`) into its 64-bit form.
pub fn parse_lsn(text: &str) -> Result<u64> {
    let (upper, lower) = text
        .split_once('/')
        .ok_or_else(|| Error::malformed(format!("invalid lsn '{text}'")))?;
    let upper = u64::from_str_radix(upper, 16)
        .map_err(|_| Error::malformed(format!("invalid lsn '{text}'")))?;
    let lower = u64::from_str_radix(lower, 16)
        .map_err(|_| Error::malformed(format!("invalid lsn '{text}'")))?;
    Ok((upper << 32) | lower)
}

/// Format a 64-bit LSN as Postgres text (`X/Y`).
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Persistence backend for replication slot positions.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, slot_name: &str) -> Option<u64>;

    /// Record a position. Saves are monotonic: a lower LSN never overwrites
    /// a higher one.
    fn save(&self, slot_name: &str, lsn: u64) -> Result<()>;

    /// Manually reset the stored position with guardrails: the caller must
    /// supply the expected current value unless `force` is set, and a new
    /// value may not exceed the current one.
    fn reset(
        &self,
        slot_name: &str,
        expected_lsn: Option<u64>,
        new_lsn: Option<u64>,
        force: bool,
    ) -> Result<()>;
}

fn check_reset(
    current: Option<u64>,
    expected_lsn: Option<u64>,
    new_lsn: Option<u64>,
    force: bool,
) -> Result<()> {
    if force {
        return Ok(());
    }
    match current {
        None => {
            if expected_lsn.is_some() {
                return Err(Error::config(
                    "resume token missing; supply --force to reset",
                ));
            }
        }
        Some(current) => {
            if expected_lsn != Some(current) {
                return Err(Error::config("unexpected resume token value"));
            }
            if let Some(new_lsn) = new_lsn {
                if new_lsn > current {
                    return Err(Error::config(
                        "new resume token must not exceed current value",
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Volatile checkpoint store for tests and the `memory` backend.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    positions: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, slot_name: &str) -> Option<u64> {
        self.positions.lock().get(slot_name).copied()
    }

    fn save(&self, slot_name: &str, lsn: u64) -> Result<()> {
        let mut positions = self.positions.lock();
        let current = positions.get(slot_name).copied();
        if current.is_none_or(|c| lsn > c) {
            positions.insert(slot_name.to_string(), lsn);
        }
        Ok(())
    }

    fn reset(
        &self,
        slot_name: &str,
        expected_lsn: Option<u64>,
        new_lsn: Option<u64>,
        force: bool,
    ) -> Result<()> {
        let mut positions = self.positions.lock();
        check_reset(positions.get(slot_name).copied(), expected_lsn, new_lsn, force)?;
        match new_lsn {
            Some(lsn) => positions.insert(slot_name.to_string(), lsn),
            None => positions.remove(slot_name),
        };
        Ok(())
    }
}

/// Durable checkpoint store writing a JSON map of slot → LSN, atomically
/// (temp file + rename), with optional fsync of the file and its directory.
pub struct FileCheckpointStore {
    path: PathBuf,
    fsync: bool,
    positions: Mutex<BTreeMap<String, u64>>,
}

impl FileCheckpointStore {
    pub fn open(path: impl Into<PathBuf>, fsync: bool) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "unable to create checkpoint directory");
            }
        }
        let positions = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => {
                match serde_json::from_str::<BTreeMap<String, u64>>(&raw) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "resume token file invalid; ignoring");
                        BTreeMap::new()
                    }
                }
            }
            _ => BTreeMap::new(),
        };
        Self {
            path,
            fsync,
            positions: Mutex::new(positions),
        }
    }

    fn write_locked(&self, positions: &BTreeMap<String, u64>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, positions)?;
            file.flush()?;
            if self.fsync {
                file.sync_all()?;
            }
        }
        std::fs::rename(&tmp, &self.path)?;
        if self.fsync {
            if let Some(parent) = self.path.parent() {
                if let Ok(dir) = std::fs::File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, slot_name: &str) -> Option<u64> {
        self.positions.lock().get(slot_name).copied()
    }

    fn save(&self, slot_name: &str, lsn: u64) -> Result<()> {
        let mut positions = self.positions.lock();
        let current = positions.get(slot_name).copied();
        if current.is_some_and(|c| lsn <= c) {
            return Ok(());
        }
        positions.insert(slot_name.to_string(), lsn);
        self.write_locked(&positions)
    }

    fn reset(
        &self,
        slot_name: &str,
        expected_lsn: Option<u64>,
        new_lsn: Option<u64>,
        force: bool,
    ) -> Result<()> {
        let mut positions = self.positions.lock();
        check_reset(positions.get(slot_name).copied(), expected_lsn, new_lsn, force)?;
        match new_lsn {
            Some(lsn) => positions.insert(slot_name.to_string(), lsn),
            None => positions.remove(slot_name),
        };
        self.write_locked(&positions)
    }
}

/// Tracks LSNs whose diffs left the buffer but have not yet settled at the
/// egress client (2xx or dead-letter).
///
/// The resume token may only advance to just below the lowest outstanding
/// LSN; with nothing outstanding the stream high watermark is safe.
#[derive(Default)]
pub struct CheckpointGate {
    outstanding: Mutex<BTreeSet<u64>>,
}

impl CheckpointGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flushed-but-unsettled LSN.
    pub fn track(&self, lsn: u64) {
        self.outstanding.lock().insert(lsn);
    }

    /// Mark an LSN settled (delivered or dead-lettered).
    pub fn confirm(&self, lsn: u64) {
        self.outstanding.lock().remove(&lsn);
        debug!(lsn = %format_lsn(lsn), "egress settled");
    }

    /// Highest LSN safe to persist given the stream position and the lowest
    /// LSN still buffered upstream.
    pub fn safe_position(&self, stream_position: u64, min_buffered: Option<u64>) -> u64 {
        let outstanding_floor = self.outstanding.lock().first().copied();
        let floor = match (outstanding_floor, min_buffered) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match floor {
            Some(floor) => stream_position.min(floor.saturating_sub(1)),
            None => stream_position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_round_trips_text_form() {
        assert_eq!(parse_lsn("0/16B3748").unwrap(), 0x16B3748);
        assert_eq!(parse_lsn("A/0").unwrap(), 0xA_0000_0000);
        assert_eq!(format_lsn(0xA_0000_0000), "A/0");
        assert_eq!(parse_lsn(&format_lsn(123_456_789)).unwrap(), 123_456_789);
        assert!(parse_lsn("garbage").is_err());
    }

    #[test]
    fn in_memory_save_is_monotonic() {
        let store = InMemoryCheckpointStore::new();
        store.save("slot", 100).unwrap();
        store.save("slot", 50).unwrap();
        assert_eq!(store.load("slot"), Some(100));
        store.save("slot", 150).unwrap();
        assert_eq!(store.load("slot"), Some(150));
    }

    #[test]
    fn reset_requires_expected_value() {
        let store = InMemoryCheckpointStore::new();
        store.save("slot", 100).unwrap();
        assert!(store.reset("slot", Some(99), None, false).is_err());
        assert!(store.reset("slot", Some(100), Some(200), false).is_err());
        store.reset("slot", Some(100), Some(40), false).unwrap();
        assert_eq!(store.load("slot"), Some(40));
        store.reset("slot", None, None, true).unwrap();
        assert_eq!(store.load("slot"), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        {
            let store = FileCheckpointStore::open(&path, false);
            store.save("uns_meta_slot", 4096).unwrap();
        }
        let store = FileCheckpointStore::open(&path, false);
        assert_eq!(store.load("uns_meta_slot"), Some(4096));
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FileCheckpointStore::open(&path, false);
        assert_eq!(store.load("slot"), None);
    }

    #[test]
    fn gate_holds_checkpoint_below_outstanding_work() {
        let gate = CheckpointGate::new();
        assert_eq!(gate.safe_position(1000, None), 1000);

        gate.track(400);
        gate.track(700);
        assert_eq!(gate.safe_position(1000, None), 399);

        gate.confirm(400);
        assert_eq!(gate.safe_position(1000, None), 699);

        gate.confirm(700);
        assert_eq!(gate.safe_position(1000, None), 1000);

        // Buffered-but-unflushed changes hold the position too.
        assert_eq!(gate.safe_position(1000, Some(250)), 249);
    }
}
