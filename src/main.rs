// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! framehaul — camera frame-file streaming transport
//!
//! Usage:
//!   framehaul send   --src-dir /cap/cam01 --host 192.168.5.101 --port 50001
//!   framehaul recv   --port 50001 --out-dir /dst/camera01 --use-dest-paths
//!   framehaul bridge --config camera_config.json --host 192.168.5.101
//!   framehaul trigger --targets 192.168.5.101:5555 --message '{...}'
//!   framehaul clear  --all --config camera_config.json --yes

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use framehaul::bridge::{self, BridgeConfig};
use framehaul::clear;
use framehaul::config::CameraMap;
use framehaul::error::HaulError;
use framehaul::receiver::aggregator::{self, AggregatorConfig, LeaderLock, LogOnlyStore};
use framehaul::receiver::cleanup::CleanupPolicy;
use framehaul::receiver::state::CounterStore;
use framehaul::receiver::worker::{self, ReceiverConfig};
use framehaul::sender::{self, SenderConfig};
use framehaul::tailer::{DirTailer, TailerConfig};

#[derive(Parser)]
#[command(name = "framehaul", about = "Camera frame-file streaming transport", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream frame files from a directory to one receiver.
    Send(SendArgs),
    /// Receive frame files and aggregate per-capture counts.
    Recv(RecvArgs),
    /// Listen for start-capture triggers and fan out sender fleets.
    Bridge(BridgeArgs),
    /// Send a trigger message to one or more bridge REP servers.
    Trigger(TriggerArgs),
    /// Delete the contents of destination directories.
    Clear(ClearArgs),
}

#[derive(Args)]
struct SendArgs {
    #[arg(long)]
    src_dir: PathBuf,
    /// Send files with names > this (lexicographic). Empty sends all.
    #[arg(long, default_value = "")]
    start_after: String,
    #[arg(long)]
    host: String,
    #[arg(long)]
    port: u16,
    /// Number of persistent connections.
    #[arg(long, default_value_t = 8)]
    conns: usize,
    #[arg(long, default_value = "*.jpg")]
    pattern: String,
    /// Treat frame N as complete once frame N+lookahead exists (0 disables).
    #[arg(long, default_value_t = 4)]
    lookahead: u64,
    /// Milliseconds between size checks in the stability fallback.
    #[arg(long, default_value_t = 5)]
    stable_ms: u64,
    /// Consecutive stable size checks required.
    #[arg(long, default_value_t = 1)]
    stable_passes: u32,
    /// Give up on a file's stability after this many seconds.
    #[arg(long, default_value_t = 1)]
    max_wait_secs: u64,
    #[arg(long, default_value_t = 10)]
    file_wait_ms: u64,
    /// Directory poll interval in the tail phase.
    #[arg(long, default_value_t = 50)]
    scan_ms: u64,
    /// Stop after sending this many files (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_files: u64,
    /// Send the current backlog and exit (no tail phase).
    #[arg(long)]
    once: bool,
    /// Destination path prefix on the receiver (empty = filename only).
    #[arg(long, default_value = "")]
    dest_path: String,
    /// Downstream key stamped on every record.
    #[arg(long, default_value = "")]
    key: String,
    /// Capture side label stamped on every record.
    #[arg(long, default_value = "")]
    side: String,
    /// Announce the total file count first (requires --conns 1 --once).
    #[arg(long)]
    count_first: bool,
    /// Sweep stale .part files on startup and during the tail phase.
    #[arg(long)]
    cleanup_part_files: bool,
    #[arg(long, default_value_t = 1)]
    part_file_max_age: u64,
    #[arg(long, default_value_t = 10)]
    cleanup_interval: u64,
    /// Print final stats as JSON on stdout.
    #[arg(long)]
    json_stats: bool,
}

#[derive(Args)]
struct RecvArgs {
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: String,
    #[arg(long)]
    port: u16,
    #[arg(long, default_value = "./")]
    out_dir: PathBuf,
    /// Concurrent connections handled by this process.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Share the port with other receiver processes (SO_REUSEPORT).
    #[arg(long)]
    reuseport: bool,
    /// Expect a u64 record count before the first record.
    #[arg(long)]
    expect_count_first: bool,
    /// Honor per-record destination paths.
    #[arg(long)]
    use_dest_paths: bool,
    #[arg(long, default_value_t = 1)]
    cleanup_max_count: u32,
    #[arg(long, default_value_t = 10)]
    cleanup_ttl_secs: u64,
    /// Per-capture receipt count that triggers the capture-ready event.
    #[arg(long, default_value_t = 100)]
    emit_threshold: u64,
    /// PUB endpoint for capture-ready events.
    #[arg(long, default_value = "tcp://127.0.0.1:5623")]
    publish_endpoint: String,
    #[arg(long, default_value = "")]
    publish_topic: String,
    /// Shared state directory (counter map + leader lock).
    #[arg(long, default_value = ".global_recv_state")]
    state_dir: PathBuf,
    /// Camera map used to build published disk paths.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct BridgeArgs {
    #[arg(long, default_value = "camera_config.json")]
    config: PathBuf,
    /// Receiver host the senders connect to.
    #[arg(long)]
    host: String,
    /// First receiver port; camera index is added per sender.
    #[arg(long, default_value_t = 50001)]
    base_port: u16,
    #[arg(long, default_value_t = 6)]
    conns: usize,
    #[arg(long, default_value = "*.jpg")]
    pattern: String,
    #[arg(long, default_value_t = 4)]
    lookahead: u64,
    #[arg(long, default_value_t = 1)]
    stable_ms: u64,
    #[arg(long, default_value_t = 1)]
    stable_passes: u32,
    /// Per-camera file cap for one trigger cycle.
    #[arg(long, default_value_t = 799)]
    max_files: u64,
    /// Wall-clock budget for one fleet cycle in seconds.
    #[arg(long, default_value_t = 5.0)]
    timeout_secs: f64,
    /// Subscribe to this upstream PUB endpoint instead of serving REP.
    #[arg(long)]
    subscribe: Option<String>,
    #[arg(long, default_value = "")]
    topic: String,
    /// REP port served when --subscribe is not given.
    #[arg(long, default_value_t = 5555)]
    reply_port: u16,
    /// Mirror raw triggers to this local PUB endpoint for peers.
    #[arg(long)]
    republish: Option<String>,
}

#[derive(Args)]
struct TriggerArgs {
    /// Targets as ip:port, space separated.
    #[arg(long, num_args = 1..)]
    targets: Vec<String>,
    #[arg(
        long,
        default_value = r#"{"frame_id": "frame_camera01_000000001.jpg", "ball_id": "BPL_270625_1_1st_0_5", "isStopped": false}"#
    )]
    message: String,
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    #[arg(long, default_value_t = 1)]
    repeat: u32,
    #[arg(long, default_value_t = 1.0)]
    interval_secs: f64,
}

#[derive(Args)]
struct ClearArgs {
    /// Explicit destination directory to clear.
    destination: Option<PathBuf>,
    /// Clear one camera's out_dir from the camera map.
    #[arg(long, conflicts_with = "all")]
    camera: Option<String>,
    /// Clear every camera's out_dir from the camera map.
    #[arg(long)]
    all: bool,
    #[arg(long, default_value = "camera_config.json")]
    config: PathBuf,
    /// Do not prompt for confirmation.
    #[arg(long, short)]
    yes: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Send(args) => run_send(args).await,
        Command::Recv(args) => run_recv(args).await,
        Command::Bridge(args) => run_bridge(args).await,
        Command::Trigger(args) => run_trigger(args).await,
        Command::Clear(args) => run_clear(args),
    };
    std::process::exit(code);
}

fn exit_code(e: &HaulError) -> i32 {
    match e {
        HaulError::Config(_) => 2,
        _ => 1,
    }
}

async fn run_send(args: SendArgs) -> i32 {
    if args.count_first && !(args.once && args.conns == 1) {
        error!("--count-first requires --once and --conns 1");
        return 2;
    }

    let tailer_cfg = TailerConfig {
        src_dir: args.src_dir,
        pattern: args.pattern,
        start_after: args.start_after,
        lookahead: args.lookahead,
        stable_ms: args.stable_ms,
        stable_passes: args.stable_passes,
        max_wait_secs: args.max_wait_secs,
        file_wait_ms: args.file_wait_ms,
        scan_interval_ms: args.scan_ms,
        max_files: args.max_files,
        once: args.once,
        cleanup_part_files: args.cleanup_part_files,
        part_max_age_secs: args.part_file_max_age,
        cleanup_interval_secs: args.cleanup_interval,
    };
    let sender_cfg = SenderConfig {
        host: args.host,
        port: args.port,
        connections: args.conns,
        key: args.key,
        side: args.side,
        dest_prefix: args.dest_path,
        count_first: args.count_first,
        ..Default::default()
    };

    let result = tokio::task::spawn_blocking(move || {
        let mut tailer = DirTailer::new(tailer_cfg)?;
        sender::run(&sender_cfg, &mut tailer)
    })
    .await;

    let report = match result {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            error!(error = %e, "Sender failed");
            return exit_code(&e);
        }
        Err(e) => {
            error!(error = %e, "Sender task panicked");
            return 1;
        }
    };

    if args.json_stats {
        let mut stats = serde_json::json!({
            "files": report.files,
            "bytes": report.bytes,
            "elapsed_s": report.elapsed.as_secs_f64(),
            "MiB": report.mib(),
            "MiB_per_s": report.mib_per_sec(),
            "files_per_s": report.files_per_sec(),
        });
        if !report.failed.is_empty() {
            stats["errors"] = report.failed.len().into();
            stats["error_files"] = report
                .failed
                .iter()
                .map(|f| f.name.clone())
                .collect::<Vec<_>>()
                .into();
        }
        println!("{stats}");
    }

    if report.failed.is_empty() {
        0
    } else {
        error!(failed = report.failed.len(), "Some files failed to transfer");
        1
    }
}

async fn run_recv(args: RecvArgs) -> i32 {
    let store = match CounterStore::new(&args.state_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Cannot open counter store");
            return exit_code(&e);
        }
    };

    // Camera map is only needed to build published disk paths; without one
    // the aggregator publishes empty path lists.
    let cameras = match &args.config {
        Some(path) => match CameraMap::from_file(path) {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "Failed to load camera map");
                return exit_code(&e);
            }
        },
        None => CameraMap::default(),
    };

    // Only the file-lock-elected leader runs the aggregator; every other
    // process serves connections and defers emission to the leader.
    match LeaderLock::acquire(&args.state_dir) {
        Ok(Some(leader)) => {
            let agg_cfg = AggregatorConfig {
                endpoint: args.publish_endpoint.clone(),
                topic: args.publish_topic.clone(),
                emit_threshold: args.emit_threshold,
            };
            let agg_store = store.clone();
            tokio::spawn(async move {
                let paths = Arc::new(LogOnlyStore);
                if let Err(e) = aggregator::run(agg_cfg, cameras, agg_store, paths, leader).await {
                    error!(error = %e, "Aggregator exited");
                }
            });
        }
        Ok(None) => {
            info!("Another process holds the leader lock; aggregator not started here");
        }
        Err(e) => {
            error!(error = %e, "Leader election failed");
            return exit_code(&e);
        }
    }

    let recv_cfg = ReceiverConfig {
        listen_ip: args.listen_ip,
        port: args.port,
        out_dir: args.out_dir,
        workers: args.workers,
        reuseport: args.reuseport,
        expect_count_first: args.expect_count_first,
        use_dest_paths: args.use_dest_paths,
        cleanup: CleanupPolicy {
            max_count: args.cleanup_max_count,
            ttl_secs: args.cleanup_ttl_secs,
        },
    };

    tokio::select! {
        result = worker::run(recv_cfg, store) => {
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "Receiver failed");
                    exit_code(&e)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down…");
            0
        }
    }
}

async fn run_bridge(args: BridgeArgs) -> i32 {
    let cameras = match CameraMap::from_file(&args.config) {
        Ok(map) => map,
        Err(e) => {
            error!(error = %e, "Failed to load camera map");
            return exit_code(&e);
        }
    };

    let bridge_cfg = BridgeConfig {
        cameras,
        host: args.host,
        base_port: args.base_port,
        connections: args.conns,
        pattern: args.pattern,
        lookahead: args.lookahead,
        stable_ms: args.stable_ms,
        stable_passes: args.stable_passes,
        max_files: args.max_files,
        timeout: Duration::from_secs_f64(args.timeout_secs),
        republish: args.republish,
    };

    let result = tokio::select! {
        result = async {
            match &args.subscribe {
                Some(endpoint) => bridge::run_subscriber(bridge_cfg, endpoint, &args.topic).await,
                None => bridge::run_reply_server(bridge_cfg, args.reply_port).await,
            }
        } => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down…");
            Ok(())
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Bridge failed");
            exit_code(&e)
        }
    }
}

async fn run_trigger(args: TriggerArgs) -> i32 {
    if args.targets.is_empty() {
        error!("No targets provided");
        return 2;
    }
    if let Err(e) = serde_json::from_str::<serde_json::Value>(&args.message) {
        error!(error = %e, "Invalid JSON message");
        return 2;
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut any_failed = false;
    for round in 0..args.repeat {
        if args.repeat > 1 {
            info!(round = round + 1, total = args.repeat, "Sending trigger");
        }
        let results = bridge::send_trigger(&args.targets, &args.message, timeout).await;
        for (target, result) in results {
            match result {
                Ok(reply) => info!(target, reply, "Trigger delivered"),
                Err(e) => {
                    warn!(target, error = %e, "Trigger failed");
                    any_failed = true;
                }
            }
        }
        if round + 1 < args.repeat {
            tokio::time::sleep(Duration::from_secs_f64(args.interval_secs)).await;
        }
    }
    if any_failed {
        1
    } else {
        0
    }
}

fn run_clear(args: ClearArgs) -> i32 {
    let cameras = if args.camera.is_some() || args.all {
        match CameraMap::from_file(&args.config) {
            Ok(map) => Some(map),
            Err(e) => {
                error!(error = %e, "Failed to load camera map");
                return 2;
            }
        }
    } else {
        None
    };

    let destinations = match clear::resolve_destinations(
        args.destination,
        args.camera.as_deref(),
        args.all,
        cameras.as_ref(),
    ) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "Nothing to clear");
            return 2;
        }
    };

    if !args.yes {
        let listing = destinations
            .iter()
            .map(|p| format!("  - {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        print!(
            "This will delete ALL contents inside the following directories:\n{listing}\nContinue? [y/N]: "
        );
        let _ = std::io::stdout().flush();
        let mut reply = String::new();
        if std::io::stdin().read_line(&mut reply).is_err() {
            return 1;
        }
        let reply = reply.trim().to_ascii_lowercase();
        if reply != "y" && reply != "yes" {
            println!("Aborted.");
            return 1;
        }
    }

    let failures = clear::clear_all(&destinations);
    if failures == 0 {
        0
    } else {
        4
    }
}
