// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-capture cleanup coordination.
//!
//! When a new capture starts re-using a capture id, the frames of the prior
//! run must be wiped before fresh ones land. Exactly one worker in the
//! receiver fleet — the first to process a file of that capture — performs
//! the wipe; everyone else skips it. Coordination is a per-capture sentinel
//! file plus an exclusive-create lock under
//! `<dest_base>/.recv_sentinels/<camera>/`.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

pub const SENTINEL_DIR: &str = ".recv_sentinels";

/// How often a capture's tree may be re-cleaned.
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// Cap on cleanups per TTL window; 0 disables cleanup entirely.
    pub max_count: u32,
    /// Sentinel age after which the cleanup count resets; 0 disables reset.
    pub ttl_secs: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self { max_count: 1, ttl_secs: 10 }
    }
}

/// Sentinel payload: how many times this capture was cleaned and when last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sentinel {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    ts: f64,
}

/// Resolve `path` lexically: drop `.` and empty components, pop on `..`.
/// No filesystem access, so it works for paths that do not exist yet.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Derive the capture id from a record's destination path.
///
/// The camera component is assumed to equal `basename(out_dir)`; the capture
/// id is the component immediately before it. When the camera name does not
/// appear in `dest_path`, the first component is used — operators who point
/// `out_dir` at a non-camera directory get first-component semantics.
pub fn derive_capture_id(dest_path: &str, out_dir: &Path) -> Option<String> {
    let parts: Vec<&str> = dest_path
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();
    if parts.is_empty() {
        return None;
    }
    let camera_name = out_dir.file_name()?.to_str()?;
    match parts.iter().position(|p| *p == camera_name) {
        Some(idx) if idx > 0 => Some(parts[idx - 1].to_string()),
        _ => Some(parts[0].to_string()),
    }
}

/// First-record-of-capture cleanup protocol. Returns whether this worker
/// performed the wipe (callers latch regardless).
pub fn run_cleanup(out_dir: &Path, dest_path: &str, policy: &CleanupPolicy) -> Result<bool> {
    let Some(capture_id) = derive_capture_id(dest_path, out_dir) else {
        return Ok(false);
    };
    let Some(camera_name) = out_dir.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    let Some(dest_base) = out_dir.parent() else {
        return Ok(false);
    };

    let sentinel_dir = dest_base.join(SENTINEL_DIR).join(camera_name);
    std::fs::create_dir_all(&sentinel_dir)?;
    let sentinel_path = sentinel_dir.join(format!("{capture_id}.done"));
    let lock_path = sentinel_dir.join(format!("{capture_id}.done.lock"));

    // Exclusive-create: losing the race means another worker owns this
    // capture's cleanup and we write our file without cleaning.
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let cleaned = clean_under_lock(out_dir, dest_base, &capture_id, camera_name, &sentinel_path, policy);
    let _ = std::fs::remove_file(&lock_path);
    cleaned
}

fn clean_under_lock(
    out_dir: &Path,
    dest_base: &Path,
    capture_id: &str,
    camera_name: &str,
    sentinel_path: &Path,
    policy: &CleanupPolicy,
) -> Result<bool> {
    let mut sentinel: Sentinel = std::fs::read_to_string(sentinel_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    if policy.ttl_secs > 0 && now - sentinel.ts >= policy.ttl_secs as f64 {
        sentinel = Sentinel { count: 0, ts: now };
    }

    if policy.max_count == 0 || sentinel.count >= policy.max_count {
        return Ok(false);
    }

    let targets = [
        out_dir.join(capture_id),
        dest_base.join(capture_id).join(camera_name),
    ];
    let base_guard = lexical_normalize(dest_base);
    for target in &targets {
        let target = lexical_normalize(target);
        // Never delete outside the destination base, whatever the
        // dest_path tried to smuggle in.
        if !target.starts_with(&base_guard) || target == base_guard {
            warn!(target = ?target, "Refusing cleanup outside destination base");
            continue;
        }
        if target.exists() {
            info!(capture = capture_id, target = ?target, "Removing prior capture data");
            if let Err(e) = std::fs::remove_dir_all(&target) {
                warn!(target = ?target, error = %e, "Cleanup failed");
            }
        }
    }

    sentinel.count += 1;
    sentinel.ts = now;
    if let Ok(body) = serde_json::to_string(&sentinel) {
        let _ = std::fs::write(sentinel_path, body);
    }
    Ok(true)
}
