use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{HaulError, Result};

/// Per-camera entry in the camera map file.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Source directory the sender tails on the capture host.
    pub src: PathBuf,
    /// Parent of the receiver's out_dir for this camera.
    pub dest_base: PathBuf,
    /// Destination prefix the sender stamps onto each file record.
    pub dest_path: PathBuf,
}

/// Camera map loaded from a JSON file: `{ "camera01": {...}, ... }`.
///
/// A `BTreeMap` keeps cameras in sorted order — port assignment and disk-path
/// construction both depend on a stable camera ordering.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CameraMap {
    #[serde(flatten)]
    pub cameras: BTreeMap<String, CameraConfig>,
}

impl CameraMap {
    /// Load the camera map from a JSON file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HaulError::Config(format!("Cannot read camera map: {e}")))?;
        let map: CameraMap = serde_json::from_str(&content)
            .map_err(|e| HaulError::Config(format!("Invalid JSON in {path:?}: {e}")))?;
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(HaulError::Config("No cameras defined".into()));
        }
        for (name, cam) in &self.cameras {
            if cam.src.as_os_str().is_empty() {
                return Err(HaulError::Config(format!("camera {name} missing 'src'")));
            }
            if cam.dest_base.as_os_str().is_empty() {
                return Err(HaulError::Config(format!("camera {name} missing 'dest_base'")));
            }
            if cam.dest_path.as_os_str().is_empty() {
                return Err(HaulError::Config(format!("camera {name} missing 'dest_path'")));
            }
        }
        Ok(())
    }

    /// Cameras in sorted order, paired with their zero-based index.
    /// The index determines the per-camera destination port offset.
    pub fn ordered(&self) -> impl Iterator<Item = (usize, &String, &CameraConfig)> {
        self.cameras
            .iter()
            .enumerate()
            .map(|(idx, (name, cfg))| (idx, name, cfg))
    }

    /// Receiver out_dir for one camera: `<dest_base>/<camera_id>`.
    pub fn out_dir(&self, camera_id: &str) -> Result<PathBuf> {
        let cam = self.cameras.get(camera_id).ok_or_else(|| {
            HaulError::Config(format!("Camera not found in config: {camera_id}"))
        })?;
        Ok(cam.dest_base.join(camera_id))
    }

    /// Disk paths published with a capture-ready event, one per camera:
    /// `<dest_path>/<capture_id>/<camera_id>` in sorted camera order.
    pub fn disk_paths(&self, capture_id: &str) -> Vec<PathBuf> {
        self.cameras
            .iter()
            .map(|(name, cfg)| cfg.dest_path.join(capture_id).join(name))
            .collect()
    }
}
