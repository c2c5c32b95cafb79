// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cross-process capture counter store.
//!
//! A single JSON file maps `capture_id` to its receipt count and metadata.
//! Every writer — receiver workers of any process on this host, and the
//! leader aggregator — takes the exclusive-create lock file, reads the whole
//! map, mutates it, writes it back via rename-over-temp, and releases the
//! lock. The lock is never held across network I/O.
//!
//! This is deliberately not a database: it is touched once per received
//! file and once per aggregator tick.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HaulError, Result};

/// Busy-wait interval and retry bound for lock contention.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(2);
const LOCK_RETRIES: u32 = 5;

/// Per-capture record persisted in the state file. Field names are the
/// on-disk JSON contract shared with any older reader of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureRecord {
    #[serde(default)]
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dragonfly_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(default)]
    pub emitted: bool,
    #[serde(default)]
    pub first_emit_ts: f64,
    #[serde(default)]
    pub last_emit_ts: f64,
}

pub type CaptureMap = BTreeMap<String, CaptureRecord>;

pub struct CounterStore {
    state_file: PathBuf,
    lock_file: PathBuf,
}

impl CounterStore {
    /// Create the store rooted at `state_dir`, creating the directory if
    /// needed.
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| HaulError::Storage(format!("Cannot create state dir: {e}")))?;
        Ok(CounterStore {
            state_file: state_dir.join("state.json"),
            lock_file: state_dir.join("state.lock"),
        })
    }

    /// Run `mutate` on the map under the exclusive lock, persisting the
    /// result. Fails with [`HaulError::LockBusy`] after the bounded
    /// busy-wait; callers decide whether that is fatal.
    pub fn with_lock<T>(&self, mutate: impl FnOnce(&mut CaptureMap) -> T) -> Result<T> {
        let mut locked = false;
        for _ in 0..LOCK_RETRIES {
            if self.try_lock()? {
                locked = true;
                break;
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
        if !locked {
            return Err(HaulError::LockBusy(format!("{:?}", self.lock_file)));
        }

        let mut map = self.read_map();
        let value = mutate(&mut map);
        let persisted = self.write_map(&map);
        self.unlock();
        persisted.map(|()| value)
    }

    /// Count one successful file receipt for `capture_id`, recording any
    /// non-empty metadata carried in the record.
    pub fn record_receipt(&self, capture_id: &str, key: &str, side: &str) -> Result<u64> {
        self.with_lock(|map| {
            let record = map.entry(capture_id.to_string()).or_default();
            record.count += 1;
            if !key.is_empty() {
                record.dragonfly_key = Some(key.to_string());
            }
            if !side.is_empty() {
                record.side = Some(side.to_string());
            }
            record.count
        })
    }

    /// Read the map without taking the lock. Test and status use only;
    /// writers must go through [`with_lock`](Self::with_lock).
    pub fn snapshot(&self) -> CaptureMap {
        self.read_map()
    }

    fn try_lock(&self) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(&self.lock_file) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(HaulError::Storage(format!("lock {:?}: {e}", self.lock_file))),
        }
    }

    fn unlock(&self) {
        let _ = std::fs::remove_file(&self.lock_file);
    }

    /// Missing or unparsable state reads as empty — first receipt of a
    /// session creates it.
    fn read_map(&self) -> CaptureMap {
        match std::fs::read_to_string(&self.state_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => CaptureMap::default(),
        }
    }

    fn write_map(&self, map: &CaptureMap) -> Result<()> {
        let tmp = self.state_file.with_extension("json.part");
        let content = serde_json::to_string(map)
            .map_err(|e| HaulError::Storage(format!("serialize state: {e}")))?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.state_file)?;
        debug!(path = ?self.state_file, captures = map.len(), "State file written");
        Ok(())
    }
}
