// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Receiver workers.
//!
//! One listener per port; `workers` tasks accept from it concurrently, each
//! handling a single connection at a time. With `SO_REUSEPORT` enabled,
//! additional receiver processes can share the same port and the kernel
//! balances accepts among them.
//!
//! Per record the worker decodes the header, runs the first-record cleanup
//! protocol, streams the payload through a `.part` temp file, fsyncs,
//! renames it into place, ACKs, and bumps the shared capture counter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::{HaulError, Result};
use crate::receiver::cleanup::{self, CleanupPolicy};
use crate::receiver::state::CounterStore;
use crate::wire::{self, ACK, CHUNK};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub listen_ip: String,
    pub port: u16,
    /// Directory received files land under. Its basename is treated as the
    /// camera name by the cleanup coordinator.
    pub out_dir: PathBuf,
    /// Concurrent connections handled by this process.
    pub workers: usize,
    pub reuseport: bool,
    /// Read a u64 record count before the first record of each connection.
    pub expect_count_first: bool,
    /// Honor the per-record destination path instead of the bare name.
    pub use_dest_paths: bool,
    pub cleanup: CleanupPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            port: 50001,
            out_dir: PathBuf::from("./"),
            workers: 1,
            reuseport: false,
            expect_count_first: false,
            use_dest_paths: false,
            cleanup: CleanupPolicy::default(),
        }
    }
}

/// Bind the listen socket with `SO_REUSEADDR` and, when configured,
/// `SO_REUSEPORT`.
pub fn bind_listener(config: &ReceiverConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.listen_ip, config.port)
        .parse()
        .map_err(|e| HaulError::Config(format!("Invalid listen address: {e}")))?;
    let socket = if let std::net::SocketAddr::V4(_) = addr {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    if config.reuseport {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(512)?)
}

/// Run the receiver until the task is cancelled. Accept loops never return
/// on their own.
pub async fn run(config: ReceiverConfig, store: Arc<CounterStore>) -> Result<()> {
    std::fs::create_dir_all(&config.out_dir)
        .map_err(|e| HaulError::Storage(format!("Cannot create out_dir: {e}")))?;

    let listener = Arc::new(bind_listener(&config)?);
    serve(listener, config, store).await
}

/// Spawn the accept tasks on an already-bound listener and wait on them.
pub async fn serve(
    listener: Arc<TcpListener>,
    config: ReceiverConfig,
    store: Arc<CounterStore>,
) -> Result<()> {
    let protocol_mode = if config.use_dest_paths { "destination paths" } else { "filename only" };
    info!(
        listen = %listener.local_addr()?,
        out_dir = ?config.out_dir,
        workers = config.workers,
        protocol = protocol_mode,
        "Receiver listening"
    );

    let mut handles = Vec::new();
    for worker_id in 0..config.workers.max(1) {
        let listener = listener.clone();
        let config = config.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            accept_loop(worker_id, listener, config, store).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn accept_loop(
    worker_id: usize,
    listener: Arc<TcpListener>,
    config: ReceiverConfig,
    store: Arc<CounterStore>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept failed");
                continue;
            }
        };
        debug!(worker = worker_id, peer = %peer, "Connection accepted");
        if let Err(e) = handle_connection(stream, &config, &store).await {
            warn!(worker = worker_id, peer = %peer, error = %e, "Connection failed");
        } else {
            debug!(worker = worker_id, peer = %peer, "Connection closed");
        }
    }
}

/// Capture id for the counter update: third-from-last component of a
/// destination path with at least three components.
fn capture_from_dest(dest_path: &str) -> Option<&str> {
    let parts: Vec<&str> = dest_path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 3 {
        Some(parts[parts.len() - 3])
    } else {
        None
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config: &ReceiverConfig,
    store: &CounterStore,
) -> Result<()> {
    let mut remaining_files = if config.expect_count_first {
        Some(wire::read_count_header(&mut stream).await?)
    } else {
        None
    };

    // First record of a capture on this connection triggers the cleanup
    // protocol once; later records skip it.
    let mut cleanup_done = false;

    loop {
        let Some(meta) = wire::read_record_meta(&mut stream).await? else {
            break;
        };

        if config.use_dest_paths && !cleanup_done && !meta.dest_path.is_empty() {
            match cleanup::run_cleanup(&config.out_dir, &meta.dest_path, &config.cleanup) {
                Ok(true) => debug!(dest = meta.dest_path, "Capture cleanup performed"),
                Ok(false) => {}
                Err(e) => warn!(dest = meta.dest_path, error = %e, "Capture cleanup failed"),
            }
            cleanup_done = true;
        }

        let final_path = if config.use_dest_paths && !meta.dest_path.is_empty() {
            config.out_dir.join(&meta.dest_path)
        } else {
            config.out_dir.join(&meta.name)
        };

        receive_payload(&mut stream, &final_path, meta.size).await?;
        stream.write_all(&[ACK]).await?;
        debug!(target = %final_path.display(), size = meta.size, "File stored");

        if config.use_dest_paths && !meta.dest_path.is_empty() {
            if let Some(capture_id) = capture_from_dest(&meta.dest_path) {
                match store.record_receipt(capture_id, &meta.key, &meta.side) {
                    Ok(count) => debug!(capture = capture_id, count, "Counter updated"),
                    // Bounded busy-wait lost the race; the receipt is not
                    // counted. Surface it rather than dropping silently.
                    Err(HaulError::LockBusy(_)) => {
                        warn!(capture = capture_id, "State lock busy, receipt not counted")
                    }
                    Err(e) => warn!(capture = capture_id, error = %e, "Counter update failed"),
                }
            }
        }

        if let Some(rem) = remaining_files.as_mut() {
            *rem -= 1;
            if *rem == 0 {
                info!("Declared file count received, closing connection");
                break;
            }
        }
    }
    Ok(())
}

/// Stream `size` payload bytes into `final_path` via a sibling `.part`
/// temp file: write, fsync, atomic rename. On any failure the temp file is
/// unlinked and the connection is failed.
async fn receive_payload(stream: &mut TcpStream, final_path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = part_path(final_path);

    let result = write_part(stream, &tmp_path, final_path, size).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

async fn write_part(
    stream: &mut TcpStream,
    tmp_path: &Path,
    final_path: &Path,
    size: u64,
) -> Result<()> {
    let mut file = tokio::fs::File::create(tmp_path).await?;
    let mut buf = vec![0u8; CHUNK.min(size.max(1) as usize)];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(HaulError::Protocol("socket closed mid-file".into()));
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp_path, final_path).await?;
    Ok(())
}

/// `<final_path>.part`, always a sibling of the target.
fn part_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}
