//! Per-capture cleanup coordinator tests: one-shot wiping, TTL reset, and
//! the destination-base escape guard.

use std::path::Path;

use tempfile::TempDir;

use framehaul::receiver::cleanup::{run_cleanup, CleanupPolicy, SENTINEL_DIR};

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn seed(dir: &Path, name: &str) {
    std::fs::create_dir_all(dir).expect("mkdir");
    std::fs::write(dir.join(name), b"x").expect("seed");
}

#[test]
fn wipes_prior_capture_tree_once() {
    let base = tmp_dir();
    let out_dir = base.path().join("camera01");
    seed(&out_dir.join("capA"), "stale.jpg");

    let policy = CleanupPolicy { max_count: 1, ttl_secs: 0 };

    let cleaned = run_cleanup(&out_dir, "capA/camera01/f.jpg", &policy).expect("cleanup");
    assert!(cleaned);
    assert!(!out_dir.join("capA").exists());

    let sentinel_path = base
        .path()
        .join(SENTINEL_DIR)
        .join("camera01")
        .join("capA.done");
    let sentinel: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&sentinel_path).unwrap()).unwrap();
    assert_eq!(sentinel["count"], 1);

    // The capture's tree fills back up; a later worker must not wipe it.
    seed(&out_dir.join("capA"), "fresh.jpg");
    let cleaned = run_cleanup(&out_dir, "capA/camera01/f.jpg", &policy).expect("cleanup");
    assert!(!cleaned);
    assert!(out_dir.join("capA/fresh.jpg").exists());
}

#[test]
fn sibling_camera_tree_is_wiped_too() {
    let base = tmp_dir();
    let out_dir = base.path().join("camera01");
    seed(&base.path().join("capA").join("camera01"), "old.jpg");
    std::fs::create_dir_all(&out_dir).unwrap();

    let policy = CleanupPolicy::default();
    let cleaned = run_cleanup(&out_dir, "capA/camera01/f.jpg", &policy).expect("cleanup");
    assert!(cleaned);
    assert!(!base.path().join("capA/camera01").exists());
}

#[test]
fn ttl_expiry_resets_the_cleanup_budget() {
    let base = tmp_dir();
    let out_dir = base.path().join("camera01");
    std::fs::create_dir_all(&out_dir).unwrap();

    let sentinel_dir = base.path().join(SENTINEL_DIR).join("camera01");
    std::fs::create_dir_all(&sentinel_dir).unwrap();
    // Sentinel from long ago, already at the cap.
    std::fs::write(sentinel_dir.join("capA.done"), r#"{"count": 1, "ts": 0.0}"#).unwrap();

    seed(&out_dir.join("capA"), "stale.jpg");
    let policy = CleanupPolicy { max_count: 1, ttl_secs: 1 };
    let cleaned = run_cleanup(&out_dir, "capA/camera01/f.jpg", &policy).expect("cleanup");
    assert!(cleaned, "expired sentinel must reset the budget");
    assert!(!out_dir.join("capA").exists());
}

#[test]
fn zero_max_count_disables_cleanup() {
    let base = tmp_dir();
    let out_dir = base.path().join("camera01");
    seed(&out_dir.join("capA"), "stale.jpg");

    let policy = CleanupPolicy { max_count: 0, ttl_secs: 0 };
    let cleaned = run_cleanup(&out_dir, "capA/camera01/f.jpg", &policy).expect("cleanup");
    assert!(!cleaned);
    assert!(out_dir.join("capA/stale.jpg").exists());
}

#[test]
fn traversal_heavy_dest_path_never_escapes_dest_base() {
    let root = tmp_dir();
    let base = root.path().join("dst");
    let out_dir = base.join("camera01");
    std::fs::create_dir_all(&out_dir).unwrap();

    // A neighbor of dest_base that a `..`-laden dest_path might aim at.
    let marker = root.path().join("marker");
    seed(&marker.join("camera01"), "keep.jpg");

    let policy = CleanupPolicy::default();
    run_cleanup(&out_dir, "../../marker/camera01/f.jpg", &policy).expect("cleanup");

    assert!(
        marker.join("camera01/keep.jpg").exists(),
        "nothing outside dest_base may be deleted"
    );
}

#[test]
fn lock_contention_skips_cleanup() {
    let base = tmp_dir();
    let out_dir = base.path().join("camera01");
    seed(&out_dir.join("capA"), "stale.jpg");

    // Pre-existing lock file: another worker owns this capture's cleanup.
    let sentinel_dir = base.path().join(SENTINEL_DIR).join("camera01");
    std::fs::create_dir_all(&sentinel_dir).unwrap();
    std::fs::write(sentinel_dir.join("capA.done.lock"), b"").unwrap();

    let policy = CleanupPolicy::default();
    let cleaned = run_cleanup(&out_dir, "capA/camera01/f.jpg", &policy).expect("cleanup");
    assert!(!cleaned);
    assert!(out_dir.join("capA/stale.jpg").exists());
}
