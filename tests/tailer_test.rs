// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Directory tailer tests: lookahead fast path, watermark monotonicity,
//! stability fallback, and stale `.part` sweeping.

use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use framehaul::tailer::{DirTailer, TailerConfig};

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn touch(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), b"data").expect("touch");
}

#[test]
fn lookahead_skips_stability_wait() {
    let src = tmp_dir();
    for i in 1..=5 {
        touch(src.path(), &format!("f_{i:07}.jpg"));
    }

    // Stability parameters are hostile on purpose: if the lookahead fast
    // path does not fire, this test takes tens of seconds.
    let mut tailer = DirTailer::new(TailerConfig {
        src_dir: src.path().to_path_buf(),
        lookahead: 4,
        stable_ms: 10_000,
        stable_passes: 3,
        max_wait_secs: 60,
        max_files: 1,
        once: true,
        ..Default::default()
    })
    .expect("tailer");

    let started = Instant::now();
    let first = tailer.next().expect("first file");
    assert_eq!(first.name, "f_0000001.jpg");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "lookahead must declare completeness without sleeping"
    );
}

#[test]
fn backlog_is_emitted_in_order_once() {
    let src = tmp_dir();
    for i in [3, 1, 2] {
        touch(src.path(), &format!("f_{i:07}.jpg"));
    }
    touch(src.path(), "ignored.txt");

    let mut tailer = DirTailer::new(TailerConfig {
        src_dir: src.path().to_path_buf(),
        lookahead: 0,
        stable_ms: 1,
        once: true,
        ..Default::default()
    })
    .expect("tailer");

    let mut names = Vec::new();
    while let Some(f) = tailer.next() {
        names.push(f.name);
    }
    assert_eq!(names, vec!["f_0000001.jpg", "f_0000002.jpg", "f_0000003.jpg"]);

    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), names.len(), "no duplicates");
}

#[test]
fn start_after_watermark_filters_backlog() {
    let src = tmp_dir();
    for i in 1..=5 {
        touch(src.path(), &format!("f_{i:07}.jpg"));
    }

    let mut tailer = DirTailer::new(TailerConfig {
        src_dir: src.path().to_path_buf(),
        start_after: "f_0000002.jpg".to_string(),
        lookahead: 4,
        stable_ms: 1,
        once: true,
        ..Default::default()
    })
    .expect("tailer");

    let mut names = Vec::new();
    while let Some(f) = tailer.next() {
        names.push(f.name);
    }
    assert_eq!(names, vec!["f_0000003.jpg", "f_0000004.jpg", "f_0000005.jpg"]);
}

#[test]
fn max_files_caps_the_session() {
    let src = tmp_dir();
    for i in 1..=10 {
        touch(src.path(), &format!("f_{i:07}.jpg"));
    }

    let mut tailer = DirTailer::new(TailerConfig {
        src_dir: src.path().to_path_buf(),
        lookahead: 4,
        stable_ms: 1,
        max_files: 4,
        once: true,
        ..Default::default()
    })
    .expect("tailer");

    let mut count = 0;
    while tailer.next().is_some() {
        count += 1;
    }
    assert_eq!(count, 4);
    assert_eq!(tailer.produced(), 4);
}

#[test]
fn stability_accepts_file_whose_size_settles() {
    let src = tmp_dir();
    touch(src.path(), "f_0000001.jpg");

    let mut tailer = DirTailer::new(TailerConfig {
        src_dir: src.path().to_path_buf(),
        lookahead: 0,
        stable_ms: 5,
        stable_passes: 2,
        max_wait_secs: 5,
        once: true,
        ..Default::default()
    })
    .expect("tailer");

    let f = tailer.next().expect("stable file emitted");
    assert_eq!(f.name, "f_0000001.jpg");
    assert!(tailer.next().is_none());
}

#[test]
fn stale_part_files_are_swept_on_startup() {
    let src = tmp_dir();
    touch(src.path(), "f_0000001.jpg");
    touch(src.path(), "f_0000002.jpg.part");
    std::thread::sleep(Duration::from_millis(50));

    let _tailer = DirTailer::new(TailerConfig {
        src_dir: src.path().to_path_buf(),
        cleanup_part_files: true,
        part_max_age_secs: 0,
        once: true,
        ..Default::default()
    })
    .expect("tailer");

    assert!(!src.path().join("f_0000002.jpg.part").exists());
    assert!(src.path().join("f_0000001.jpg").exists());
}
