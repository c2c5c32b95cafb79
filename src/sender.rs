// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Sender engine — streams tailed frame files to one receiver over a pool
//! of persistent TCP connections.
//!
//! ```text
//! DirTailer ──→ bounded queue ──┬─→ connection worker 0 ──┐
//!                               ├─→ connection worker 1 ──┼──→ receiver
//!                               └─→ connection worker N ──┘
//! ```
//!
//! Workers are plain blocking threads: each owns one socket, pulls jobs from
//! the shared queue, and serializes file records with a per-file ACK. A
//! failed transfer closes the socket, reconnects, and retries the same file
//! up to `max_retries` times before the file lands in the error report.
//! A `None` on the queue is the shutdown poison.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{HaulError, Result};
use crate::tailer::DirTailer;
use crate::wire::{self, RecordMeta, ACK, CHUNK};

/// One sender session toward a single receiver worker pool.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub host: String,
    pub port: u16,
    /// Number of persistent connections (worker threads).
    pub connections: usize,
    /// Opaque downstream key stamped on every record.
    pub key: String,
    /// Opaque capture label stamped on every record.
    pub side: String,
    /// Destination prefix; empty means files land under their own name.
    pub dest_prefix: String,
    /// Announce the total record count before streaming (backlog only).
    pub count_first: bool,
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50001,
            connections: 8,
            key: String::new(),
            side: String::new(),
            dest_prefix: String::new(),
            count_first: false,
            max_retries: 3,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// A file that exhausted its retries.
#[derive(Debug, Clone)]
pub struct FailedFile {
    pub name: String,
    pub error: String,
}

/// Final session counters.
#[derive(Debug)]
pub struct SendReport {
    pub files: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub failed: Vec<FailedFile>,
}

impl SendReport {
    pub fn mib(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn mib_per_sec(&self) -> f64 {
        self.mib() / self.elapsed.as_secs_f64().max(1e-9)
    }

    pub fn files_per_sec(&self) -> f64 {
        self.files as f64 / self.elapsed.as_secs_f64().max(1e-9)
    }
}

#[derive(Debug, Default)]
struct Counters {
    files: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug)]
struct Job {
    src_path: PathBuf,
    name: String,
    dest_path: String,
}

fn make_dest(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), name)
    }
}

/// Drive one full sender session: feed the worker pool from the tailer,
/// wait for the queue to drain, and collect the final report.
pub fn run(config: &SenderConfig, tailer: &mut DirTailer) -> Result<SendReport> {
    if config.connections == 0 {
        return Err(HaulError::Config("connections must be > 0".into()));
    }
    if config.count_first && config.connections != 1 {
        return Err(HaulError::Config("count-first mode requires exactly 1 connection".into()));
    }

    let start = Instant::now();
    let capacity = 1024.max(config.connections * 128);
    let (job_tx, job_rx) = bounded::<Option<Job>>(capacity);
    let (err_tx, err_rx) = unbounded::<FailedFile>();
    let counters = Counters::default();

    // Counted mode announces the total up front, so the whole backlog has
    // to be discovered before the first byte goes out.
    let backlog: Option<Vec<Job>> = if config.count_first {
        let mut jobs = Vec::new();
        while let Some(f) = tailer.next() {
            let dest_path = make_dest(&config.dest_prefix, &f.name);
            jobs.push(Job { src_path: f.path, name: f.name, dest_path });
        }
        Some(jobs)
    } else {
        None
    };
    let announce = backlog.as_ref().map(|jobs| AtomicU64::new(jobs.len() as u64));

    std::thread::scope(|scope| {
        for tid in 0..config.connections {
            let rx = job_rx.clone();
            let err_tx = err_tx.clone();
            let counters = &counters;
            let announce = announce.as_ref();
            scope.spawn(move || worker_loop(tid, config, rx, err_tx, counters, announce));
        }
        drop(job_rx);

        match backlog {
            Some(jobs) => {
                for job in jobs {
                    if job_tx.send(Some(job)).is_err() {
                        break;
                    }
                }
            }
            None => {
                while let Some(f) = tailer.next() {
                    let dest_path = make_dest(&config.dest_prefix, &f.name);
                    let job = Job { src_path: f.path, name: f.name, dest_path };
                    if job_tx.send(Some(job)).is_err() {
                        break;
                    }
                }
            }
        }

        for _ in 0..config.connections {
            let _ = job_tx.send(None);
        }
        drop(job_tx);
    });

    drop(err_tx);
    let failed: Vec<FailedFile> = err_rx.try_iter().collect();

    let report = SendReport {
        files: counters.files.load(Ordering::Relaxed),
        bytes: counters.bytes.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
        failed,
    };
    info!(
        files = report.files,
        mib = format!("{:.2}", report.mib()),
        rate = format!("{:.2} MiB/s", report.mib_per_sec()),
        failed = report.failed.len(),
        "Sender session finished"
    );
    Ok(report)
}

fn worker_loop(
    tid: usize,
    config: &SenderConfig,
    rx: Receiver<Option<Job>>,
    err_tx: Sender<FailedFile>,
    counters: &Counters,
    announce: Option<&AtomicU64>,
) {
    let mut sock: Option<TcpStream> = None;

    while let Ok(item) = rx.recv() {
        let Some(job) = item else { break };

        let mut attempt = 0u32;
        loop {
            let outcome = transfer_once(&mut sock, config, &job, counters, announce);
            match outcome {
                Ok(()) => break,
                Err(e) => {
                    // Any failure invalidates the connection; the receiver
                    // has already dropped its in-flight .part file.
                    sock = None;
                    attempt += 1;
                    if attempt > config.max_retries {
                        warn!(worker = tid, name = job.name, error = %e, "File failed after retries");
                        let _ = err_tx.send(FailedFile { name: job.name.clone(), error: e.to_string() });
                        break;
                    }
                    debug!(worker = tid, name = job.name, attempt, error = %e, "Retrying file");
                }
            }
        }
    }
}

fn transfer_once(
    sock: &mut Option<TcpStream>,
    config: &SenderConfig,
    job: &Job,
    counters: &Counters,
    announce: Option<&AtomicU64>,
) -> Result<()> {
    if sock.is_none() {
        *sock = Some(connect(config, announce)?);
    }
    let stream = sock.as_mut().expect("socket just connected");
    send_file(stream, config, job, counters)?;
    if let Some(remaining) = announce {
        remaining.fetch_sub(1, Ordering::Relaxed);
    }
    Ok(())
}

fn connect(config: &SenderConfig, announce: Option<&AtomicU64>) -> Result<TcpStream> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| HaulError::Connect {
            addr: format!("{}:{}", config.host, config.port),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| HaulError::Connect {
            addr: format!("{}:{}", config.host, config.port),
            reason: "no address resolved".into(),
        })?;

    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
        HaulError::Connect { addr: addr.to_string(), reason: e.to_string() }
    })?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.ack_timeout))?;

    // A reconnect mid-session announces only what is still outstanding;
    // the receiver treats each connection as its own counted session.
    if let Some(remaining) = announce {
        let mut w = &stream;
        wire::write_count_header(&mut w, remaining.load(Ordering::Relaxed))?;
    }
    Ok(stream)
}

fn send_file(
    stream: &mut TcpStream,
    config: &SenderConfig,
    job: &Job,
    counters: &Counters,
) -> Result<()> {
    let size = std::fs::metadata(&job.src_path)?.len();
    let meta = RecordMeta {
        name: job.name.clone(),
        dest_path: job.dest_path.clone(),
        key: config.key.clone(),
        side: config.side.clone(),
        size,
    };
    let header = wire::encode_header(&meta)?;
    stream.write_all(&header)?;

    let mut file = File::open(&job.src_path)?;
    send_payload(stream, &mut file, size)?;

    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).map_err(|e| {
        HaulError::Protocol(format!("receiver closed without ACK for {}: {e}", job.name))
    })?;
    if ack[0] != ACK {
        return Err(HaulError::Protocol(format!("unexpected ACK byte {:#04x}", ack[0])));
    }

    counters.files.fetch_add(1, Ordering::Relaxed);
    counters.bytes.fetch_add(size, Ordering::Relaxed);
    debug!(name = job.name, dest = job.dest_path, size, "File acknowledged");
    Ok(())
}

/// Stream the payload file into the socket, zero-copy where the platform
/// allows it.
#[cfg(target_os = "linux")]
fn send_payload(stream: &mut TcpStream, file: &mut File, size: u64) -> Result<()> {
    use std::os::fd::AsFd;

    let mut offset: i64 = 0;
    while (offset as u64) < size {
        let remaining = size - offset as u64;
        let to_send = remaining.min(8 * CHUNK as u64) as usize;
        match nix::sys::sendfile::sendfile(stream.as_fd(), file.as_fd(), Some(&mut offset), to_send)
        {
            Ok(0) => {
                return Err(HaulError::Protocol("connection closed mid-payload".into()));
            }
            // Partial sends resume from the kernel-advanced offset.
            Ok(_sent) => {}
            Err(nix::errno::Errno::EINTR) => {}
            Err(_) => {
                // Filesystem does not support sendfile; finish chunked from
                // the current offset.
                use std::io::{Seek, SeekFrom};
                file.seek(SeekFrom::Start(offset as u64))?;
                return send_chunked(stream, file, size - offset as u64);
            }
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_payload(stream: &mut TcpStream, file: &mut File, size: u64) -> Result<()> {
    send_chunked(stream, file, size)
}

fn send_chunked(stream: &mut TcpStream, file: &mut File, mut remaining: u64) -> Result<()> {
    let mut buf = vec![0u8; CHUNK];
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(HaulError::Storage("source file truncated mid-send".into()));
        }
        stream.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
