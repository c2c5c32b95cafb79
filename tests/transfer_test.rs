// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Transfer integration tests: sender engine ↔ receiver workers over
//! loopback TCP.
//!
//! Run with: `cargo test`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use framehaul::receiver::cleanup::CleanupPolicy;
use framehaul::receiver::state::CounterStore;
use framehaul::receiver::worker::{self, ReceiverConfig};
use framehaul::sender::{self, SenderConfig};
use framehaul::tailer::{DirTailer, TailerConfig};

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn write_frame(dir: &Path, name: &str, data: &[u8]) {
    std::fs::write(dir.join(name), data).expect("write frame");
}

/// Bind a receiver on an ephemeral loopback port and serve in background.
fn start_receiver(
    out_dir: PathBuf,
    state_dir: PathBuf,
    expect_count_first: bool,
    use_dest_paths: bool,
) -> (SocketAddr, Arc<CounterStore>) {
    let config = ReceiverConfig {
        listen_ip: "127.0.0.1".to_string(),
        port: 0,
        out_dir,
        workers: 2,
        reuseport: false,
        expect_count_first,
        use_dest_paths,
        cleanup: CleanupPolicy { max_count: 1, ttl_secs: 0 },
    };
    let listener = Arc::new(worker::bind_listener(&config).expect("bind"));
    let addr = listener.local_addr().expect("local addr");
    let store = Arc::new(CounterStore::new(&state_dir).expect("store"));
    let serve_store = store.clone();
    tokio::spawn(async move {
        let _ = worker::serve(listener, config, serve_store).await;
    });
    (addr, store)
}

fn quick_tailer(src_dir: PathBuf) -> TailerConfig {
    TailerConfig {
        src_dir,
        stable_ms: 1,
        once: true,
        ..Default::default()
    }
}

async fn run_sender(config: SenderConfig, tailer_cfg: TailerConfig) -> sender::SendReport {
    tokio::task::spawn_blocking(move || {
        let mut tailer = DirTailer::new(tailer_cfg).expect("tailer");
        sender::run(&config, &mut tailer).expect("sender run")
    })
    .await
    .expect("sender task")
}

fn no_part_files(dir: &Path) -> bool {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&d) else { continue };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "part") {
                return false;
            }
        }
    }
    true
}

#[tokio::test]
async fn single_file_roundtrip() {
    let src = tmp_dir();
    let dst = tmp_dir();
    let state = tmp_dir();
    let payload: Vec<u8> = (0u8..10).collect();
    write_frame(src.path(), "a.jpg", &payload);

    let (addr, _store) =
        start_receiver(dst.path().to_path_buf(), state.path().to_path_buf(), false, false);

    let config = SenderConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connections: 1,
        ..Default::default()
    };
    let report = run_sender(config, quick_tailer(src.path().to_path_buf())).await;

    assert_eq!(report.files, 1);
    assert_eq!(report.bytes, 10);
    assert!(report.failed.is_empty());

    let received = std::fs::read(dst.path().join("a.jpg")).expect("received file");
    assert_eq!(received, payload);
    assert!(no_part_files(dst.path()));
}

#[tokio::test]
async fn counted_session_transfers_announced_files() {
    let src = tmp_dir();
    let dst = tmp_dir();
    let state = tmp_dir();
    for name in ["x1.jpg", "x2.jpg", "x3.jpg"] {
        write_frame(src.path(), name, name.as_bytes());
    }

    let (addr, _store) =
        start_receiver(dst.path().to_path_buf(), state.path().to_path_buf(), true, false);

    let config = SenderConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connections: 1,
        count_first: true,
        ..Default::default()
    };
    let report = run_sender(config, quick_tailer(src.path().to_path_buf())).await;

    assert_eq!(report.files, 3);
    assert!(report.failed.is_empty());
    for name in ["x1.jpg", "x2.jpg", "x3.jpg"] {
        assert_eq!(
            std::fs::read(dst.path().join(name)).expect("received"),
            name.as_bytes()
        );
    }
    assert!(no_part_files(dst.path()));
}

#[tokio::test]
async fn dest_paths_update_capture_counter() {
    let src = tmp_dir();
    let base = tmp_dir();
    let state = tmp_dir();
    let out_dir = base.path().join("camera01");
    std::fs::create_dir_all(&out_dir).unwrap();
    write_frame(src.path(), "frame_000001.jpg", b"one");
    write_frame(src.path(), "frame_000002.jpg", b"two");

    let (addr, store) =
        start_receiver(out_dir.clone(), state.path().to_path_buf(), false, true);

    let config = SenderConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connections: 2,
        dest_prefix: "capA/camera01".to_string(),
        key: "capA_V0".to_string(),
        side: "FE".to_string(),
        ..Default::default()
    };
    let report = run_sender(config, quick_tailer(src.path().to_path_buf())).await;
    assert_eq!(report.files, 2);

    assert!(out_dir.join("capA/camera01/frame_000001.jpg").exists());
    assert!(out_dir.join("capA/camera01/frame_000002.jpg").exists());

    let map = store.snapshot();
    let record = map.get("capA").expect("capture record");
    assert_eq!(record.count, 2);
    assert_eq!(record.dragonfly_key.as_deref(), Some("capA_V0"));
    assert_eq!(record.side.as_deref(), Some("FE"));
    assert!(!record.emitted);
}

#[tokio::test]
async fn prior_capture_data_wiped_exactly_once() {
    let src1 = tmp_dir();
    let src2 = tmp_dir();
    let base = tmp_dir();
    let state = tmp_dir();
    let out_dir = base.path().join("camera01");

    // Leftovers from an earlier run of the same capture id.
    std::fs::create_dir_all(out_dir.join("capA")).unwrap();
    write_frame(&out_dir.join("capA"), "stale.jpg", b"stale");

    write_frame(src1.path(), "frame_000001.jpg", b"one");
    write_frame(src2.path(), "frame_000002.jpg", b"two");

    let (addr, _store) =
        start_receiver(out_dir.clone(), state.path().to_path_buf(), false, true);

    let config = SenderConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connections: 1,
        dest_prefix: "capA/camera01".to_string(),
        ..Default::default()
    };

    let report = run_sender(config.clone(), quick_tailer(src1.path().to_path_buf())).await;
    assert_eq!(report.files, 1);
    assert!(!out_dir.join("capA/stale.jpg").exists(), "stale data must be wiped");
    assert!(out_dir.join("capA/camera01/frame_000001.jpg").exists());

    // A second connection for the same capture must not wipe again.
    let report = run_sender(config, quick_tailer(src2.path().to_path_buf())).await;
    assert_eq!(report.files, 1);
    assert!(
        out_dir.join("capA/camera01/frame_000001.jpg").exists(),
        "first session's frames must survive the second session"
    );
    assert!(out_dir.join("capA/camera01/frame_000002.jpg").exists());

    let sentinel_path = base.path().join(".recv_sentinels/camera01/capA.done");
    let sentinel: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(sentinel_path).expect("sentinel")).unwrap();
    assert_eq!(sentinel["count"], 1);
}

#[tokio::test]
async fn oversized_name_length_fails_connection_without_artifacts() {
    let dst = tmp_dir();
    let state = tmp_dir();
    let (addr, _store) =
        start_receiver(dst.path().to_path_buf(), state.path().to_path_buf(), false, false);

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    stream.write_u64(4097).await.expect("write len");
    stream.write_all(&vec![b'x'; 4097]).await.expect("write name");

    // The receiver must drop the connection without ACKing anything.
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "receiver should close the connection");

    assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
    assert!(no_part_files(dst.path()));
}

#[tokio::test]
async fn failed_destination_is_reported_after_retries() {
    let src = tmp_dir();
    write_frame(src.path(), "frame_000001.jpg", b"one");

    // Nothing listens on this port: connect() gets refused every attempt.
    let config = SenderConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        connections: 1,
        connect_timeout: std::time::Duration::from_millis(200),
        ..Default::default()
    };
    let report = run_sender(config, quick_tailer(src.path().to_path_buf())).await;

    assert_eq!(report.files, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "frame_000001.jpg");
}
