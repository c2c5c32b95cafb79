// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Trigger bridge — turns incoming start-capture messages into a fleet of
//! sender sessions, one per camera.
//!
//! Two flavors share the same parsing and fan-out:
//!  - a SUB client connected to an upstream publisher (fire-and-forget),
//!  - a REP server that answers each trigger synchronously once the fleet
//!    finishes.
//!
//! Each camera gets its own in-process sender engine on a derived port
//! (`base_port + camera index`), a `start_after` watermark rebuilt from the
//! trigger's frame id, and a destination prefix of
//! `<dest_path>/<capture_id>/<camera_id>`. The whole cycle runs under one
//! wall-clock timeout; engines still running at expiry are abandoned.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CameraMap;
use crate::error::{HaulError, Result};
use crate::sender::{self, SendReport, SenderConfig};
use crate::tailer::{DirTailer, TailerConfig};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub cameras: CameraMap,
    /// Receiver host every sender connects to.
    pub host: String,
    /// First receiver port; camera index is added per sender.
    pub base_port: u16,
    /// Connections per sender engine.
    pub connections: usize,
    pub pattern: String,
    pub lookahead: u64,
    pub stable_ms: u64,
    pub stable_passes: u32,
    /// Per-camera cap on files sent for one trigger.
    pub max_files: u64,
    /// Wall-clock budget for one full fleet cycle.
    pub timeout: Duration,
    /// Local PUB endpoint the raw trigger is mirrored to, for peer machines.
    pub republish: Option<String>,
}

/// Incoming trigger message. Field names are the upstream wire contract.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerMessage {
    pub frame_id: Option<String>,
    pub ball_id: Option<String>,
    #[serde(default)]
    pub dragonfly_key: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, rename = "isStopped")]
    pub is_stopped: bool,
}

/// Extract the zero-padded frame index from a trigger's frame id, e.g.
/// `frame_camera01_000046836.jpg` → `000046836`.
pub fn parse_frame_suffix(frame_id: &str) -> Result<String> {
    let re = Regex::new(r"^frame_[^_]+_(\d{9})\.jpg$").expect("frame id pattern");
    let caps = re
        .captures(frame_id)
        .ok_or_else(|| HaulError::Trigger(format!("Invalid frame_id format: {frame_id}")))?;
    Ok(caps[1].to_string())
}

/// Outcome of one fleet cycle, keyed by camera.
#[derive(Debug)]
pub struct FleetOutcome {
    pub reports: Vec<(String, SendReport)>,
    pub failed_cameras: Vec<String>,
    pub timed_out: bool,
}

impl FleetOutcome {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.failed_cameras.is_empty()
    }
}

/// Launch one sender engine per camera and wait for the fleet under the
/// configured wall-clock timeout.
pub async fn launch_fleet(
    config: &BridgeConfig,
    suffix: &str,
    capture_id: &str,
    key: &str,
    side: &str,
) -> FleetOutcome {
    let mut handles: Vec<(String, JoinHandle<Result<SendReport>>)> = Vec::new();

    for (idx, name, cam) in config.cameras.ordered() {
        let start_after = format!("frame_{name}_{suffix}.jpg");
        let dest_prefix = format!(
            "{}/{}/{}",
            cam.dest_path.display().to_string().trim_end_matches('/'),
            capture_id,
            name
        );
        let sender_cfg = SenderConfig {
            host: config.host.clone(),
            port: config.base_port + idx as u16,
            connections: config.connections,
            key: key.to_string(),
            side: side.to_string(),
            dest_prefix,
            ..Default::default()
        };
        let tailer_cfg = TailerConfig {
            src_dir: cam.src.clone(),
            pattern: config.pattern.clone(),
            start_after: start_after.clone(),
            lookahead: config.lookahead,
            stable_ms: config.stable_ms,
            stable_passes: config.stable_passes,
            max_files: config.max_files,
            once: true,
            ..Default::default()
        };
        info!(
            camera = name,
            port = sender_cfg.port,
            start_after,
            "Starting sender for trigger"
        );
        let camera = name.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut tailer = DirTailer::new(tailer_cfg)?;
            sender::run(&sender_cfg, &mut tailer)
        });
        handles.push((camera, handle));
    }

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    let mut outcome = FleetOutcome {
        reports: Vec::new(),
        failed_cameras: Vec::new(),
        timed_out: false,
    };

    for (camera, handle) in &mut handles {
        tokio::select! {
            _ = &mut deadline => {
                outcome.timed_out = true;
                break;
            }
            joined = handle => {
                match joined {
                    Ok(Ok(report)) => {
                        if !report.failed.is_empty() {
                            outcome.failed_cameras.push(camera.clone());
                        }
                        outcome.reports.push((camera.clone(), report));
                    }
                    Ok(Err(e)) => {
                        error!(camera = %camera, error = %e, "Sender engine failed");
                        outcome.failed_cameras.push(camera.clone());
                    }
                    Err(e) => {
                        error!(camera = %camera, error = %e, "Sender task panicked");
                        outcome.failed_cameras.push(camera.clone());
                    }
                }
            }
        }
    }

    if outcome.timed_out {
        warn!(timeout = ?config.timeout, "Fleet timed out, abandoning remaining senders");
        for (_, handle) in &handles {
            handle.abort();
        }
    }
    outcome
}

/// Shared trigger handling: validate, derive parameters, run the fleet.
async fn handle_trigger(config: &BridgeConfig, trigger: &TriggerMessage) -> Result<String> {
    if trigger.is_stopped {
        info!("Trigger flagged isStopped, ignoring");
        return Ok("IGNORED: isStopped".to_string());
    }
    let frame_id = trigger
        .frame_id
        .as_deref()
        .ok_or_else(|| HaulError::Trigger("missing 'frame_id'".into()))?;
    let capture_id = trigger
        .ball_id
        .as_deref()
        .ok_or_else(|| HaulError::Trigger("missing 'ball_id'".into()))?;
    let suffix = parse_frame_suffix(frame_id)?;
    let key = trigger.dragonfly_key.as_deref().unwrap_or("");
    let side = trigger.side.as_deref().unwrap_or("");

    info!(capture = capture_id, suffix, "Launching sender fleet");
    let outcome = launch_fleet(config, &suffix, capture_id, key, side).await;
    if outcome.ok() {
        Ok(format!("SUCCESS: launched with start-after={suffix}"))
    } else if outcome.timed_out {
        Err(HaulError::Trigger("fleet timed out".into()))
    } else {
        Err(HaulError::Trigger(format!(
            "one or more senders failed ({})",
            outcome.failed_cameras.join(", ")
        )))
    }
}

fn parse_trigger(raw: &[u8]) -> Result<TriggerMessage> {
    serde_json::from_slice(raw).map_err(|e| HaulError::Trigger(format!("invalid JSON: {e}")))
}

/// SUB flavor: subscribe to an upstream publisher and run a fleet per
/// trigger. Runs until the socket closes.
pub async fn run_subscriber(
    config: BridgeConfig,
    endpoint: &str,
    topic: &str,
) -> Result<()> {
    let ctx = tmq::Context::new();
    let mut socket = tmq::subscribe(&ctx)
        .connect(endpoint)?
        .subscribe(topic.as_bytes())?;
    info!(endpoint, topic, "Bridge subscribed to upstream triggers");

    let mut republisher = match &config.republish {
        Some(pub_endpoint) => {
            let sock = tmq::publish(&ctx).bind(pub_endpoint)?;
            info!(endpoint = pub_endpoint, "Re-publishing triggers locally");
            Some(sock)
        }
        None => None,
    };

    while let Some(msg) = socket.next().await {
        let multipart = msg?;
        // With a topic filter the payload is the last frame.
        let Some(body) = multipart.iter().last() else {
            continue;
        };
        let raw = body.to_vec();

        if let Some(pub_sock) = republisher.as_mut() {
            let parts: Vec<zmq::Message> =
                multipart.iter().map(|m| zmq::Message::from(&**m)).collect();
            if let Err(e) = pub_sock.send(tmq::Multipart::from(parts)).await {
                warn!(error = %e, "Trigger re-publish failed");
            }
        }

        match parse_trigger(&raw) {
            Ok(trigger) => match handle_trigger(&config, &trigger).await {
                Ok(status) => info!(status, "Trigger handled"),
                Err(e) => error!(error = %e, "Trigger failed"),
            },
            Err(e) => warn!(error = %e, "Unparsable trigger message"),
        }
    }
    Ok(())
}

/// REP flavor: serve triggers synchronously, replying `SUCCESS: …` or
/// `ERROR: …` after the fleet terminates.
pub async fn run_reply_server(config: BridgeConfig, port: u16) -> Result<()> {
    let ctx = tmq::Context::new();
    let mut recv_sock = tmq::reply(&ctx).bind(&format!("tcp://*:{port}"))?;
    info!(port, "Bridge reply server listening for triggers");

    loop {
        let (multipart, send_sock) = recv_sock.recv().await?;
        let reply = match multipart.iter().last() {
            Some(body) => match parse_trigger(&body.to_vec()) {
                Ok(trigger) => match handle_trigger(&config, &trigger).await {
                    Ok(status) => status,
                    Err(e) => format!("ERROR: {e}"),
                },
                Err(e) => format!("ERROR: {e}"),
            },
            None => "ERROR: empty message".to_string(),
        };
        let parts: Vec<zmq::Message> = vec![reply.as_bytes().into()];
        recv_sock = send_sock.send(tmq::Multipart::from(parts)).await?;
    }
}

/// Fire one trigger message at several REP servers in parallel. Returns
/// `(target, reply)` pairs; a missing reply within `timeout` is an error
/// entry.
pub async fn send_trigger(
    targets: &[String],
    message: &str,
    timeout: Duration,
) -> Vec<(String, Result<String>)> {
    let mut tasks = Vec::new();
    for target in targets {
        let target = target.clone();
        let message = message.to_string();
        tasks.push(tokio::spawn(async move {
            let result = request_once(&target, &message, timeout).await;
            (target, result)
        }));
    }
    let mut results = Vec::new();
    for task in tasks {
        match task.await {
            Ok(pair) => results.push(pair),
            Err(e) => results.push(("<join>".to_string(), Err(HaulError::Trigger(e.to_string())))),
        }
    }
    results
}

async fn request_once(target: &str, message: &str, timeout: Duration) -> Result<String> {
    let ctx = tmq::Context::new();
    let endpoint = format!("tcp://{target}");
    let send_sock = tmq::request(&ctx).connect(&endpoint)?;
    let parts: Vec<zmq::Message> = vec![message.as_bytes().into()];

    let exchange = async move {
        let recv_sock = send_sock.send(tmq::Multipart::from(parts)).await?;
        let (reply, _next) = recv_sock.recv().await?;
        let text = reply
            .iter()
            .last()
            .and_then(|m| m.as_str().map(str::to_string))
            .unwrap_or_default();
        Ok::<String, HaulError>(text)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HaulError::Trigger(format!("Timeout sending to {target}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_suffix_extraction() {
        assert_eq!(
            parse_frame_suffix("frame_camera01_000046836.jpg").unwrap(),
            "000046836"
        );
        assert!(parse_frame_suffix("frame_cam_01_000046836.jpg").is_err());
        assert!(parse_frame_suffix("frame_camera01_12345.jpg").is_err());
        assert!(parse_frame_suffix("not_a_frame.jpg").is_err());
    }

    #[test]
    fn trigger_json_field_names() {
        let raw = r#"{
            "frame_id": "frame_camera01_000000001.jpg",
            "ball_id": "BPL_1",
            "dragonfly_key": "BPL_1_V0",
            "side": "FE",
            "isStopped": false
        }"#;
        let t: TriggerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(t.ball_id.as_deref(), Some("BPL_1"));
        assert!(!t.is_stopped);

        let stopped: TriggerMessage =
            serde_json::from_str(r#"{"isStopped": true}"#).unwrap();
        assert!(stopped.is_stopped);
    }
}
