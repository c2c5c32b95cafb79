// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Directory tailer — turns a producer's live frame directory into a lazy
//! sequence of completed filenames, strictly increasing in lexicographic
//! order.
//!
//! A file is declared complete either by the lookahead fast path (the
//! producer writes frames in sequence, so frame *i* is closed once frame
//! *i+k* exists) or by the size-stability fallback. The `last_name`
//! watermark only moves forward, so no name is ever produced twice within
//! one session.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use glob::Pattern;
use tracing::{debug, info, warn};

use crate::error::{HaulError, Result};
use crate::frames::FrameName;

/// Tuning knobs for one tail session. Field defaults mirror the sender CLI.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Directory to watch.
    pub src_dir: PathBuf,
    /// Glob the filenames must match.
    pub pattern: String,
    /// Only names lexicographically greater than this are produced.
    pub start_after: String,
    /// Lookahead distance; 0 disables the fast path.
    pub lookahead: u64,
    /// Milliseconds between size checks in the stability loop.
    pub stable_ms: u64,
    /// Consecutive equal size readings required.
    pub stable_passes: u32,
    /// Give up on the stability loop after this many seconds.
    pub max_wait_secs: u64,
    /// Milliseconds to wait while the file does not exist yet.
    pub file_wait_ms: u64,
    /// Polling interval between directory scans in the tail phase.
    pub scan_interval_ms: u64,
    /// Stop after producing this many names (0 = unlimited).
    pub max_files: u64,
    /// Produce the current backlog only, no tail phase.
    pub once: bool,
    /// Sweep stale `.part` files on startup and during the tail phase.
    pub cleanup_part_files: bool,
    /// A `.part` file older than this is considered abandoned.
    pub part_max_age_secs: u64,
    /// Interval between periodic `.part` sweeps (0 = startup only).
    pub cleanup_interval_secs: u64,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            src_dir: PathBuf::from("."),
            pattern: "*.jpg".to_string(),
            start_after: String::new(),
            lookahead: 4,
            stable_ms: 5,
            stable_passes: 1,
            max_wait_secs: 1,
            file_wait_ms: 10,
            scan_interval_ms: 50,
            max_files: 0,
            once: false,
            cleanup_part_files: false,
            part_max_age_secs: 1,
            cleanup_interval_secs: 10,
        }
    }
}

/// One ready-to-send file produced by the tailer.
#[derive(Debug, Clone)]
pub struct TailedFile {
    pub path: PathBuf,
    pub name: String,
}

pub struct DirTailer {
    config: TailerConfig,
    pattern: Pattern,
    last_name: String,
    produced: u64,
    pending: VecDeque<String>,
    scanned_once: bool,
    last_cleanup: Instant,
}

impl DirTailer {
    pub fn new(config: TailerConfig) -> Result<Self> {
        let pattern = Pattern::new(&config.pattern)
            .map_err(|e| HaulError::Config(format!("Invalid glob '{}': {e}", config.pattern)))?;
        let mut tailer = DirTailer {
            last_name: config.start_after.clone(),
            pattern,
            config,
            produced: 0,
            pending: VecDeque::new(),
            scanned_once: false,
            last_cleanup: Instant::now(),
        };
        if tailer.config.cleanup_part_files {
            let removed = tailer.sweep_stale_parts();
            if removed > 0 {
                info!(removed, "Removed stale .part files on startup");
            }
        }
        Ok(tailer)
    }

    /// Number of names produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Blocking: return the next completed file, or `None` when the session
    /// is over (`once` backlog drained, or `max_files` reached).
    pub fn next(&mut self) -> Option<TailedFile> {
        loop {
            if self.config.max_files > 0 && self.produced >= self.config.max_files {
                return None;
            }

            if let Some(name) = self.pending.pop_front() {
                let path = self.config.src_dir.join(&name);
                if self.is_complete(&name, &path) {
                    self.last_name = name.clone();
                    self.produced += 1;
                    return Some(TailedFile { path, name });
                }
                warn!(name, "File not ready, skipping");
                continue;
            }

            if self.scanned_once {
                if self.config.once {
                    return None;
                }
                self.periodic_cleanup();
                std::thread::sleep(Duration::from_millis(self.config.scan_interval_ms));
            }
            self.pending = self.discover();
            self.scanned_once = true;
        }
    }

    /// List the directory, filter by glob and watermark, sort.
    fn discover(&self) -> VecDeque<String> {
        let entries = match std::fs::read_dir(&self.config.src_dir) {
            Ok(e) => e,
            Err(_) => return VecDeque::new(),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| self.pattern.matches(n) && n.as_str() > self.last_name.as_str())
            .collect();
        names.sort();
        names.into()
    }

    fn is_complete(&self, name: &str, path: &Path) -> bool {
        if self.config.lookahead > 0 {
            if let Some(frame) = FrameName::parse(name) {
                let sibling = self.config.src_dir.join(frame.advanced(self.config.lookahead));
                if sibling.exists() {
                    return true;
                }
            }
        }
        self.wait_for_stable(path)
    }

    /// Wait for `path` to exist, then require `stable_passes` consecutive
    /// equal size readings. At the deadline an existing file is accepted as
    /// complete; a missing one is skipped.
    fn wait_for_stable(&self, path: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(self.config.max_wait_secs);

        while !path.exists() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(self.config.file_wait_ms));
        }

        let mut last = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => return false,
        };

        let mut stable = 0u32;
        while stable < self.config.stable_passes {
            if Instant::now() > deadline {
                if self.config.stable_ms > 0 {
                    warn!(path = ?path, "File did not stabilize in time, treating as complete");
                }
                return true;
            }
            std::thread::sleep(Duration::from_millis(self.config.stable_ms));
            let now = match std::fs::metadata(path) {
                Ok(m) => m.len(),
                Err(_) => return false,
            };
            if now == last {
                stable += 1;
            } else {
                stable = 0;
                last = now;
            }
        }
        true
    }

    fn periodic_cleanup(&mut self) {
        if !self.config.cleanup_part_files || self.config.cleanup_interval_secs == 0 {
            return;
        }
        if self.last_cleanup.elapsed() < Duration::from_secs(self.config.cleanup_interval_secs) {
            return;
        }
        let removed = self.sweep_stale_parts();
        if removed > 0 {
            debug!(removed, "Periodic sweep removed stale .part files");
        }
        self.last_cleanup = Instant::now();
    }

    /// Delete `<pattern>.part` files older than `part_max_age_secs`.
    /// Abandoned partial writes from a crashed producer would otherwise
    /// sit in the directory forever.
    fn sweep_stale_parts(&mut self) -> usize {
        let part_pattern = match Pattern::new(&format!("{}.part", self.config.pattern)) {
            Ok(p) => p,
            Err(_) => return 0,
        };
        let entries = match std::fs::read_dir(&self.config.src_dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let max_age = Duration::from_secs(self.config.part_max_age_secs);
        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let Ok(name) = entry.file_name().into_string() else { continue };
            if !part_pattern.matches(&name) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            if let Some(age) = age {
                if age > max_age && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }
}
