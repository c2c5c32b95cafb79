// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Single-leader capture aggregator.
//!
//! Exactly one process per install directory — the one holding the leader
//! lock — polls the shared counter map and publishes a capture-ready event
//! the moment a capture's receipt count crosses the emit threshold. The
//! `emitted` flag is flipped inside the same critical section that reads
//! the count, so each capture is announced at most once per session.
//!
//! The external key-value write that records disk paths is best-effort and
//! goes through the injected [`PathStore`] handle.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CameraMap;
use crate::error::{HaulError, Result};
use crate::receiver::state::CounterStore;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// PUB endpoint the capture-ready events are bound to.
    pub endpoint: String,
    /// Optional topic frame; empty publishes single-frame messages.
    pub topic: String,
    /// Per-camera receipt count that marks a capture complete.
    pub emit_threshold: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5623".to_string(),
            topic: String::new(),
            emit_threshold: 100,
        }
    }
}

/// Handle to the external key-value store that carries the newline-joined
/// disk paths for downstream consumers. Failures are logged, never fatal.
pub trait PathStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Default handle when no external store is wired: logs the write and
/// drops it.
pub struct LogOnlyStore;

impl PathStore for LogOnlyStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        info!(key, paths = value.lines().count(), "Frame paths recorded (log only)");
        Ok(())
    }
}

/// Capture-ready event published on the bus. Field names are the wire
/// contract with downstream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyEvent {
    pub ball_id: String,
    pub diskpaths: Vec<String>,
    pub dragonfly_key: String,
    pub side: String,
}

impl fmt::Display for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} paths)", self.ball_id, self.diskpaths.len())
    }
}

// ────────────────────────── leader election ──────────────────────────────

/// Exclusive-create leader lock with the owner PID recorded in the file.
/// A lock whose owner no longer exists is treated as claimable, so a
/// crashed leader does not wedge the fleet.
pub struct LeaderLock {
    path: PathBuf,
}

impl LeaderLock {
    pub fn acquire(state_dir: &Path) -> Result<Option<LeaderLock>> {
        let path = state_dir.join("leader.lock");
        for _ in 0..2 {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(Some(LeaderLock { path }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::owner_alive(&path) {
                        return Ok(None);
                    }
                    warn!(path = ?path, "Removing stale leader lock");
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => {
                    return Err(HaulError::Storage(format!("leader lock {path:?}: {e}")));
                }
            }
        }
        Ok(None)
    }

    fn owner_alive(path: &Path) -> bool {
        let mut content = String::new();
        let Ok(mut f) = std::fs::File::open(path) else {
            return false;
        };
        if f.read_to_string(&mut content).is_err() {
            return false;
        }
        let Ok(pid) = content.trim().parse::<i32>() else {
            // No PID recorded (older writer); assume the owner is live.
            return true;
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ────────────────────────── aggregation loop ─────────────────────────────

/// Run the aggregator loop. Holds `_leader` for the lifetime of the task so
/// the lock file outlives it.
pub async fn run(
    config: AggregatorConfig,
    cameras: CameraMap,
    store: Arc<CounterStore>,
    paths: Arc<dyn PathStore>,
    _leader: LeaderLock,
) -> Result<()> {
    let ctx = tmq::Context::new();
    let mut publisher = tmq::publish(&ctx).bind(&config.endpoint)?;
    info!(endpoint = config.endpoint, threshold = config.emit_threshold, "Aggregator started");

    // Brief warm-up so slow-joining subscribers catch the first event.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut tick = tokio::time::interval(Duration::from_millis(100));
    loop {
        tick.tick().await;

        let ready = match drain_ready(config.emit_threshold, &cameras, &store) {
            Ok(events) => events,
            Err(HaulError::LockBusy(_)) => continue,
            Err(e) => {
                warn!(error = %e, "Aggregator state read failed");
                continue;
            }
        };

        for event in ready {
            record_paths(&*paths, &event);
            publish(&mut publisher, &config.topic, &event).await;
        }
    }
}

/// Flip `emitted` for every capture over threshold inside the lock and
/// return the events to announce. The lock is released before any network
/// I/O happens.
pub fn drain_ready(
    threshold: u64,
    cameras: &CameraMap,
    store: &CounterStore,
) -> Result<Vec<ReadyEvent>> {
    store.with_lock(|map| {
        let mut ready = Vec::new();
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        for (capture_id, record) in map.iter_mut() {
            if record.emitted || record.count < threshold {
                continue;
            }
            let key = record
                .dragonfly_key
                .clone()
                .unwrap_or_else(|| format!("{capture_id}_V0"));
            let side = record.side.clone().unwrap_or_else(|| "FE".to_string());
            let diskpaths = cameras
                .disk_paths(capture_id)
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            ready.push(ReadyEvent {
                ball_id: capture_id.clone(),
                diskpaths,
                dragonfly_key: key,
                side,
            });
            record.emitted = true;
            if record.first_emit_ts == 0.0 {
                record.first_emit_ts = now;
            }
            record.last_emit_ts = now;
        }
        ready
    })
}

/// `<key minus trailing "_V0">_FRAMEPATHS` → newline-joined disk paths.
pub fn framepaths_entry(event: &ReadyEvent) -> (String, String) {
    let base = event
        .dragonfly_key
        .strip_suffix("_V0")
        .unwrap_or(&event.dragonfly_key);
    (format!("{base}_FRAMEPATHS"), event.diskpaths.join("\n"))
}

fn record_paths(paths: &dyn PathStore, event: &ReadyEvent) {
    let (key, value) = framepaths_entry(event);
    if let Err(e) = paths.set(&key, &value) {
        warn!(capture = event.ball_id, error = %e, "Frame path store write failed");
    }
}

async fn publish(publisher: &mut tmq::publish::Publish, topic: &str, event: &ReadyEvent) {
    let body = match serde_json::to_vec(event) {
        Ok(b) => b,
        Err(e) => {
            warn!(capture = event.ball_id, error = %e, "Event serialization failed");
            return;
        }
    };
    let parts: Vec<zmq::Message> = if topic.is_empty() {
        vec![body.as_slice().into()]
    } else {
        vec![topic.as_bytes().into(), body.as_slice().into()]
    };
    match publisher.send(tmq::Multipart::from(parts)).await {
        Ok(()) => info!(capture = %event, "Capture-ready event published"),
        Err(e) => warn!(capture = event.ball_id, error = %e, "Event publish failed"),
    }
}
