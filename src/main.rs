// MIT License - Copyright (c) 2026 zway-core contributors
// Controller simulator: drives a zway-core controller against simulated nodes

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, info, warn};

use zway_core::constants::{command_class, function, transmit};
use zway_core::transport::channel::{self, RadioHandle};
use zway_core::{Controller, ControllerConfig, ControllerEvent, DataValue, Devices, JobBuilder};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "zway-sim")]
#[command(about = "Run the Z-Wave controller core against a simulated node population")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "zway-sim.toml")]
    config: String,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    run_for: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    controller: ControllerToml,
    #[serde(default)]
    sim: SimToml,
    #[serde(default, rename = "node")]
    nodes: Vec<NodeToml>,
}

#[derive(Debug, Deserialize)]
struct ControllerToml {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_ack_timeout")]
    ack_timeout_ms: u64,
    #[serde(default = "default_response_timeout")]
    response_timeout_ms: u64,
    #[serde(default = "default_callback_timeout")]
    callback_timeout_ms: u64,
    #[serde(default = "default_max_sends")]
    max_sends: u8,
    #[serde(default = "default_done_retention")]
    done_retention_ms: u64,
}

impl Default for ControllerToml {
    fn default() -> Self {
        Self {
            name: default_name(),
            ack_timeout_ms: default_ack_timeout(),
            response_timeout_ms: default_response_timeout(),
            callback_timeout_ms: default_callback_timeout(),
            max_sends: default_max_sends(),
            done_retention_ms: default_done_retention(),
        }
    }
}

fn default_name() -> String {
    "zway-sim".to_string()
}
fn default_ack_timeout() -> u64 {
    zway_core::constants::DEFAULT_ACK_TIMEOUT_MS
}
fn default_response_timeout() -> u64 {
    zway_core::constants::DEFAULT_RESPONSE_TIMEOUT_MS
}
fn default_callback_timeout() -> u64 {
    zway_core::constants::DEFAULT_CALLBACK_TIMEOUT_MS
}
fn default_max_sends() -> u8 {
    zway_core::constants::DEFAULT_MAX_SENDS
}
fn default_done_retention() -> u64 {
    zway_core::constants::DEFAULT_DONE_RETENTION_MS
}

#[derive(Debug, Deserialize)]
struct SimToml {
    /// How often every node is pinged
    #[serde(default = "default_poll_interval")]
    poll_interval_secs: u64,
    /// How often the queue and data tree are dumped
    #[serde(default = "default_report_interval")]
    report_interval_secs: u64,
    /// How long a battery node stays awake after a wake-up notification
    #[serde(default = "default_awake_secs")]
    awake_secs: u64,
}

impl Default for SimToml {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            report_interval_secs: default_report_interval(),
            awake_secs: default_awake_secs(),
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}
fn default_report_interval() -> u64 {
    30
}
fn default_awake_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
struct NodeToml {
    id: u8,
    /// Mains powered; battery nodes only answer while awake
    #[serde(default = "default_true")]
    listening: bool,
    /// Unreachable nodes never acknowledge delivery
    #[serde(default = "default_true")]
    reachable: bool,
    /// Wake-up interval of a battery node
    #[serde(default = "default_wake_interval")]
    wake_interval_secs: u64,
    #[serde(default)]
    command_classes: Vec<u8>,
}

fn default_true() -> bool {
    true
}
fn default_wake_interval() -> u64 {
    20
}

fn build_controller_config(toml: &ControllerToml) -> ControllerConfig {
    ControllerConfig::builder()
        .name(&toml.name)
        .ack_timeout_ms(toml.ack_timeout_ms)
        .response_timeout_ms(toml.response_timeout_ms)
        .callback_timeout_ms(toml.callback_timeout_ms)
        .max_sends(toml.max_sends)
        .done_retention_ms(toml.done_retention_ms)
        .build()
}

// ---------------------------------------------------------------------------
// Simulated radio
// ---------------------------------------------------------------------------

struct SimNode {
    config: NodeToml,
    awake: bool,
    switch_level: u8,
    next_wakeup: Instant,
}

type SimNodes = Arc<Mutex<HashMap<u8, SimNode>>>;

/// Answer one controller frame on behalf of the addressed node.
fn answer(
    radio: &RadioHandle,
    nodes: &SimNodes,
    frame: &zway_core::transport::Frame,
) -> zway_core::Result<()> {
    if frame.function_id != function::SEND_DATA {
        debug!("Radio: ignoring function {:#04x}", frame.function_id);
        return radio.ack();
    }

    let mut nodes = nodes.lock();
    let Some(node) = nodes.get_mut(&frame.node_id).filter(|n| n.config.reachable) else {
        radio.ack()?;
        radio.respond(frame.function_id, [0x01])?;
        return radio.complete(frame, transmit::COMPLETE_NO_ACK);
    };
    if !node.config.listening && !node.awake {
        radio.ack()?;
        radio.respond(frame.function_id, [0x01])?;
        return radio.complete(frame, transmit::COMPLETE_NO_ACK);
    }

    radio.deliver(frame)?;
    match frame.payload.as_slice() {
        [command_class::SWITCH_BINARY, 0x01, level, ..] => node.switch_level = *level,
        [command_class::SWITCH_BINARY, 0x02] => {
            radio.report(frame.node_id, [command_class::SWITCH_BINARY, 0x03, node.switch_level])?;
        }
        _ => {}
    }
    Ok(())
}

async fn run_radio(mut radio: RadioHandle, nodes: SimNodes) {
    let mut tick = interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            frame = radio.next_frame() => {
                let Some(frame) = frame else { break };
                if let Err(e) = answer(&radio, &nodes, &frame) {
                    warn!("Radio: {}", e);
                    break;
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let mut waking = Vec::new();
                for (id, node) in nodes.lock().iter_mut() {
                    if !node.config.listening && !node.awake && node.next_wakeup <= now {
                        node.awake = true;
                        let interval = Duration::from_secs(node.config.wake_interval_secs);
                        node.next_wakeup = now + interval;
                        waking.push(*id);
                    }
                }
                for id in waking {
                    debug!("Radio: node {} woke up", id);
                    if radio.report(id, [command_class::WAKE_UP, 0x07]).is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!("Radio: controller side closed");
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Seconds since the epoch, if they fit the tree's 32-bit integers.
fn epoch_seconds(time: DateTime<Utc>) -> Option<i32> {
    let secs = time.timestamp();
    match i32::try_from(secs) {
        Ok(secs) => Some(secs),
        Err(_) => {
            warn!("Timestamp {} does not fit a 32-bit integer, not recorded", secs);
            None
        }
    }
}

fn handle_report(devices: &Devices, node_id: u8, function_id: u8, payload: &[u8]) {
    if function_id != function::APPLICATION_COMMAND_HANDLER {
        return;
    }
    let update = match payload {
        [command_class::WAKE_UP, 0x07, ..] => {
            let Some(secs) = epoch_seconds(Utc::now()) else {
                return;
            };
            devices
                .find_device_instance_cc_data(node_id, 0, command_class::WAKE_UP, "lastWakeup")
                .map(|h| (h, DataValue::Int(secs)))
        }
        [command_class::SWITCH_BINARY, 0x03, level, ..] => devices
            .find_device_instance_cc_data(node_id, 0, command_class::SWITCH_BINARY, "level")
            .map(|h| (h, DataValue::Bool(*level != 0))),
        _ => return,
    };
    match update.and_then(|(holder, value)| devices.tree().set(holder, value)) {
        Ok(()) => debug!("Node {} report applied", node_id),
        Err(e) => warn!("Node {} report dropped: {}", node_id, e),
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn print_report(controller: &Controller) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "--- queue ({}) ---", if controller.is_idle() { "idle" } else { "busy" })?;
    controller.queue_inspect(&mut out)?;
    let tree = controller.data();
    let snapshot = tree.snapshot_json(tree.root())?;
    writeln!(out, "--- data ---")?;
    writeln!(out, "{}", serde_json::to_string_pretty(&snapshot)?)?;
    Ok(())
}

fn poll_nodes(controller: &Controller, nodes: &[NodeToml]) {
    for node in nodes {
        let id = node.id;
        let job = if node.command_classes.contains(&command_class::SWITCH_BINARY) {
            JobBuilder::new(id, function::SEND_DATA, vec![command_class::SWITCH_BINARY, 0x02])
                .identity("SwitchBinary.Get")
                .description("SwitchBinary Get")
                .expect_response()
                .expect_callback()
        } else {
            JobBuilder::new(id, function::SEND_DATA, vec![command_class::NO_OPERATION])
                .identity("NoOperation")
                .description("NOP")
                .expect_response()
                .expect_callback()
        };
        let mut job = job
            .on_success(move |report| {
                debug!("Node {} answered after {} sends", id, report.send_count)
            })
            .on_failure(move |_, e| info!("Node {} did not answer: {}", id, e));
        if let Some(secs) = epoch_seconds(Utc::now()) {
            job = job.stage(format!("devices.{}.data.lastPoll", id), secs);
        }
        if let Err(e) = controller.enqueue(job) {
            warn!("Could not poll node {}: {}", id, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=zway_core=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    let config_text = std::fs::read_to_string(&cli.config).context("Failed to read config file")?;
    let config: Config = toml::from_str(&config_text).context("Failed to parse config file")?;

    let (transport, radio) = channel::link();
    let mut controller = Controller::start(build_controller_config(&config.controller), transport)?;
    let mut events = controller.subscribe();
    controller.set_frame_handler(handle_report);

    let now = Instant::now();
    let sim_nodes: SimNodes = Arc::new(Mutex::new(HashMap::new()));
    for node in &config.nodes {
        controller.devices().add_device(node.id)?;
        for cc in &node.command_classes {
            controller.devices().add_command_class(node.id, 0, *cc, true)?;
        }
        if !node.listening {
            controller.devices().add_command_class(node.id, 0, command_class::WAKE_UP, true)?;
        }
        controller.set_device_listening(node.id, node.listening);
        sim_nodes.lock().insert(
            node.id,
            SimNode {
                config: node.clone(),
                awake: false,
                switch_level: 0,
                next_wakeup: now + Duration::from_secs(node.wake_interval_secs),
            },
        );
    }
    info!("Simulating {} nodes", config.nodes.len());
    tokio::spawn(run_radio(radio, sim_nodes.clone()));

    let mut poll = interval(Duration::from_secs(config.sim.poll_interval_secs.max(1)));
    let mut report = interval(Duration::from_secs(config.sim.report_interval_secs.max(1)));
    let mut sleep_check = interval(Duration::from_millis(250));
    let mut asleep_at: HashMap<u8, Instant> = HashMap::new();
    let awake_for = Duration::from_secs(config.sim.awake_secs);

    let mut sigterm = signal(SignalKind::terminate())?;
    let run_for = async {
        match cli.run_for {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(run_for);

    loop {
        tokio::select! {
            _ = poll.tick() => poll_nodes(&controller, &config.nodes),
            _ = report.tick() => {
                if let Err(e) = print_report(&controller) {
                    warn!("Report failed: {}", e);
                }
            }
            _ = sleep_check.tick() => {
                let now = Instant::now();
                let due: Vec<u8> = asleep_at
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in due {
                    asleep_at.remove(&id);
                    if let Some(node) = sim_nodes.lock().get_mut(&id) {
                        node.awake = false;
                    }
                    controller.set_device_asleep(id);
                }
            }
            event = events.recv() => match event {
                Ok(ControllerEvent::NodeAwake { node_id }) => {
                    info!("Node {} is awake", node_id);
                    asleep_at.insert(node_id, Instant::now() + awake_for);
                }
                Ok(ControllerEvent::NodeAsleep { node_id }) => info!("Node {} is asleep", node_id),
                Ok(ControllerEvent::JobCompleted { job_id, node_id, success }) => {
                    debug!("Job {} for node {} done (success={})", job_id, node_id, success);
                }
                Ok(ControllerEvent::Terminated) => {
                    warn!("Controller terminated");
                    break;
                }
                Ok(ControllerEvent::Started) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged, skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = &mut run_for => {
                info!("Run time elapsed, shutting down");
                break;
            }
        }
    }

    controller.stop().await?;
    print_report(&controller)?;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_epoch_seconds_rejects_out_of_range_times() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        assert_eq!(epoch_seconds(now), Some(1_792_152_000));
        let late = Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(epoch_seconds(late), None);
    }
}
