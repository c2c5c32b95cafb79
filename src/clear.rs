//! Destination clear tool.
//!
//! Deletes the contents of receiver destination directories while keeping
//! the directories themselves, with guard rails against catastrophic paths.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::config::CameraMap;
use crate::error::{HaulError, Result};

/// Refuse near-root destinations: `/` itself, or anything shallower than
/// three path components.
pub fn is_dangerous(path: &Path) -> bool {
    let resolved = match std::path::absolute(path) {
        Ok(p) => p,
        Err(_) => return true,
    };
    if resolved == Path::new("/") {
        return true;
    }
    resolved.components().count() < 3
}

/// Per-destination result: children deleted and children that failed.
#[derive(Debug, Default)]
pub struct ClearOutcome {
    pub deleted: usize,
    pub errors: usize,
}

/// Delete every child of `destination`, keeping the directory itself.
pub fn clear_directory(destination: &Path) -> Result<ClearOutcome> {
    let mut outcome = ClearOutcome::default();
    for entry in std::fs::read_dir(destination)? {
        let entry = entry?;
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir() && !t.is_symlink()).unwrap_or(false);
        let removed = if is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removed {
            Ok(()) => outcome.deleted += 1,
            Err(e) => {
                error!(path = ?path, error = %e, "Failed to delete");
                outcome.errors += 1;
            }
        }
    }
    Ok(outcome)
}

/// Resolve the destinations for a clear request: an explicit path, one
/// camera's out_dir, or every camera's out_dir from the map.
pub fn resolve_destinations(
    explicit: Option<PathBuf>,
    camera: Option<&str>,
    all: bool,
    cameras: Option<&CameraMap>,
) -> Result<Vec<PathBuf>> {
    let mut destinations = Vec::new();
    if let Some(dest) = explicit {
        destinations.push(dest);
    }

    if camera.is_some() || all {
        let map = cameras.ok_or_else(|| {
            HaulError::Config("Camera map required for --camera/--all".into())
        })?;
        if let Some(cam) = camera {
            destinations.push(map.out_dir(cam)?);
        } else {
            for (_, name, _) in map.ordered() {
                destinations.push(map.out_dir(name)?);
            }
        }
    }

    if destinations.is_empty() {
        return Err(HaulError::Config(
            "Provide a destination path or use --camera/--all".into(),
        ));
    }

    // Deduplicate while preserving order.
    let mut seen = std::collections::HashSet::new();
    destinations.retain(|d| seen.insert(std::path::absolute(d).unwrap_or_else(|_| d.clone())));
    Ok(destinations)
}

/// Clear all destinations. Returns the number of destinations that failed
/// (missing, dangerous, or partially deleted).
pub fn clear_all(destinations: &[PathBuf]) -> usize {
    let mut failures = 0;
    for dest in destinations {
        if !dest.exists() {
            error!(dest = ?dest, "Destination does not exist");
            failures += 1;
            continue;
        }
        if !dest.is_dir() {
            error!(dest = ?dest, "Destination is not a directory");
            failures += 1;
            continue;
        }
        if is_dangerous(dest) {
            error!(dest = ?dest, "Refusing to operate on potentially dangerous path");
            failures += 1;
            continue;
        }
        match clear_directory(dest) {
            Ok(outcome) => {
                info!(dest = ?dest, deleted = outcome.deleted, "Destination cleared");
                if outcome.errors > 0 {
                    error!(dest = ?dest, errors = outcome.errors, "Some items failed to delete");
                    failures += 1;
                }
            }
            Err(e) => {
                error!(dest = ?dest, error = %e, "Clear failed");
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_shallow_paths_are_dangerous() {
        assert!(is_dangerous(Path::new("/")));
        assert!(is_dangerous(Path::new("/home")));
        assert!(!is_dangerous(Path::new("/data/captures/cam01")));
    }
}
