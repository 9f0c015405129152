//! Command-line front end for the lidar-runtime library: start a runtime
//! against a JSON config, list admitted devices, send one raw command, drive
//! a firmware upgrade, or start/stop a debug point-cloud capture.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use lidar_runtime::command_ids::{
    COMPLETE_XFER_FIRMWARE, GET_UPGRADE_PROGRESS, START_UPGRADE, XFER_FIRMWARE,
};
use lidar_runtime::config::SdkConfig;
use lidar_runtime::handle::DeviceHandle;
use lidar_runtime::registry::DeviceStage;
use lidar_runtime::runtime::{Runtime, RuntimeOptions};
use lidar_runtime::upgrade::{UpgradeAckCode, UpgradeEvent, UpgradeSession, UpgradeState, INTER_CHUNK_DELAY};

#[derive(Parser)]
#[command(name = "lidar-host", version, about = "Host-side control and telemetry runtime for networked LiDAR sensors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the runtime and keep it running until Ctrl-C.
    Run {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
    /// List devices admitted into the registry so far.
    List {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Send one raw command to a device and print its ack payload.
    Send {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        /// Device handle: either a dotted IPv4 address or a 0x-prefixed hex value.
        #[arg(long)]
        handle: String,
        /// Command id, hex, e.g. 0x0200.
        #[arg(long)]
        cmd_id: String,
        /// Payload as hex bytes, e.g. 0a1b2c. Empty by default.
        #[arg(long, default_value = "")]
        payload: String,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Drive a firmware upgrade to completion.
    Upgrade {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long)]
        handle: String,
        #[arg(long)]
        firmware: PathBuf,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Capture raw debug point-cloud traffic for a device to disk.
    Capture {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long)]
        handle: String,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config } => cmd_run(config).await,
        Command::List { config, wait_secs, format } => cmd_list(config, wait_secs, format).await,
        Command::Send { config, handle, cmd_id, payload, wait_secs } => {
            cmd_send(config, &handle, &cmd_id, &payload, wait_secs).await
        }
        Command::Upgrade { config, handle, firmware, wait_secs } => {
            cmd_upgrade(config, &handle, firmware, wait_secs).await
        }
        Command::Capture { config, handle, root, duration_secs, wait_secs } => {
            cmd_capture(config, &handle, root, duration_secs, wait_secs).await
        }
    };

    if let Err(err) = &result {
        eprintln!("{} {}", "error:".red().bold(), err);
    }
    result
}

fn parse_handle(raw: &str) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    if let Ok(ip) = raw.parse::<Ipv4Addr>() {
        return Ok(DeviceHandle::from_ipv4(ip));
    }
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    let raw_value = u32::from_str_radix(hex, 16)
        .map_err(|_| format!("'{raw}' is not a valid IPv4 address or 0x-prefixed handle"))?;
    Ok(DeviceHandle::from_ipv4(Ipv4Addr::from(raw_value.to_ne_bytes())))
}

fn parse_cmd_id(raw: &str) -> Result<u16, Box<dyn std::error::Error>> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    u16::from_str_radix(hex, 16).map_err(|_| format!("'{raw}' is not a valid hex command id").into())
}

fn parse_hex_payload(raw: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if raw.len() % 2 != 0 {
        return Err("payload hex string must have an even number of digits".into());
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|e| e.into()))
        .collect()
}

async fn load_runtime(config: PathBuf, options: RuntimeOptions) -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = SdkConfig::load(&config)?;
    let runtime = Runtime::init(config, options).await?;
    Ok(runtime)
}

/// Blocks until `handle`'s registry record reaches [`DeviceStage::Ready`] or
/// `wait` elapses.
async fn wait_ready(runtime: &Runtime, handle: DeviceHandle, wait: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Some(record) = runtime.registry.get(handle).await {
            if record.stage == DeviceStage::Ready {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("device {handle} did not become ready within {wait:?}").into());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn cmd_run(config: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = load_runtime(config, RuntimeOptions::default()).await?;
    println!("{} runtime started, press Ctrl-C to stop", "✓".green());
    tokio::signal::ctrl_c().await?;
    println!("{} shutting down", "…".dimmed());
    runtime.shutdown().await;
    Ok(())
}

async fn cmd_list(config: PathBuf, wait_secs: u64, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = load_runtime(config, RuntimeOptions::default()).await?;
    tokio::time::sleep(Duration::from_secs(wait_secs)).await;

    let handles = runtime.registry.all_handles().await;
    let mut rows = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Some(record) = runtime.registry.get(handle).await {
            rows.push(record);
        }
    }

    match format {
        OutputFormat::Json => {
            let payload: Vec<_> = rows
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "handle": handle_hex(r.handle),
                        "lidar_ip": r.lidar_ip,
                        "serial_number": r.serial_number,
                        "device_type": format!("{:?}", r.device_type),
                        "stage": format!("{:?}", r.stage),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "no devices admitted yet".yellow());
            }
            println!("{:<12} {:<16} {:<10} {}", "SERIAL".bold(), "IP".bold(), "FAMILY".bold(), "STAGE".bold());
            for record in &rows {
                let stage = match record.stage {
                    DeviceStage::Ready => format!("{:?}", record.stage).green(),
                    DeviceStage::Configuring => format!("{:?}", record.stage).yellow(),
                    DeviceStage::Probing => format!("{:?}", record.stage).dimmed(),
                };
                println!("{:<12} {:<16} {:<10} {}", record.serial_number, record.lidar_ip, format!("{:?}", record.device_type), stage);
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn handle_hex(handle: DeviceHandle) -> String {
    format!("{:#010x}", handle.raw())
}

async fn cmd_send(
    config: PathBuf,
    handle: &str,
    cmd_id: &str,
    payload: &str,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = parse_handle(handle)?;
    let cmd_id = parse_cmd_id(cmd_id)?;
    let payload = parse_hex_payload(payload)?;

    let runtime = load_runtime(config, RuntimeOptions::default()).await?;
    wait_ready(&runtime, handle, Duration::from_secs(wait_secs)).await?;

    match runtime.send_command(handle, cmd_id, payload).await {
        Ok(ack) => {
            println!("{} ack payload: {}", "✓".green(), hex_string(&ack));
        }
        Err(err) => {
            println!("{} command failed: {}", "✗".red(), err);
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn ack_code(byte: u8) -> UpgradeAckCode {
    match byte {
        0 => UpgradeAckCode::Ok,
        1 => UpgradeAckCode::SystemIsNotReady,
        2 => UpgradeAckCode::EraseFirmware,
        _ => UpgradeAckCode::Other,
    }
}

async fn cmd_upgrade(
    config: PathBuf,
    handle: &str,
    firmware: PathBuf,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = parse_handle(handle)?;
    let firmware = tokio::fs::read(&firmware).await?;

    let runtime = load_runtime(config, RuntimeOptions::default()).await?;
    wait_ready(&runtime, handle, Duration::from_secs(wait_secs)).await?;

    let result = drive_upgrade(&runtime, handle, firmware).await;
    runtime.shutdown().await;
    result
}

/// Drives an [`UpgradeSession`] to completion by issuing the matching
/// command for each FSM state and feeding the ack back into `apply`.
async fn drive_upgrade(runtime: &Runtime, handle: DeviceHandle, firmware: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = UpgradeSession::new(firmware);
    session.apply(UpgradeEvent::RequestUpgrade);

    loop {
        match session.state {
            UpgradeState::Requesting => {
                let ack = runtime
                    .send_command(handle, START_UPGRADE, (session.firmware.len() as u32).to_le_bytes().to_vec())
                    .await?;
                let code = ack_code(ack.first().copied().unwrap_or(0xFF));
                session.apply(UpgradeSession::event_for_ack(code));
            }
            UpgradeState::Transferring => {
                let Some(chunk) = session.next_chunk().map(<[u8]>::to_vec) else {
                    session.apply(UpgradeEvent::CompleteXfer);
                    continue;
                };
                let mut payload = (session.read_offset as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(&chunk);
                let ack = runtime.send_command(handle, XFER_FIRMWARE, payload).await?;
                let code = ack_code(ack.first().copied().unwrap_or(0xFF));
                if matches!(code, UpgradeAckCode::Ok) {
                    session.advance_chunk();
                    session.apply(UpgradeEvent::XferFirmware);
                } else {
                    session.apply(UpgradeSession::event_for_ack(code));
                }
                tokio::time::sleep(INTER_CHUNK_DELAY).await;
            }
            UpgradeState::Completing => {
                let ack = runtime.send_command(handle, COMPLETE_XFER_FIRMWARE, Vec::new()).await?;
                let code = ack_code(ack.first().copied().unwrap_or(0xFF));
                if matches!(code, UpgradeAckCode::Ok) {
                    session.apply(UpgradeEvent::GetProgress { progress: 0 });
                } else {
                    session.apply(UpgradeSession::event_for_ack(code));
                }
            }
            UpgradeState::Polling => {
                let ack = runtime.send_command(handle, GET_UPGRADE_PROGRESS, Vec::new()).await?;
                let progress = ack.first().copied().unwrap_or(0);
                println!("{} upgrade progress: {progress}%", "…".dimmed());
                session.apply(UpgradeEvent::GetProgress { progress });
                if progress >= 100 {
                    session.apply(UpgradeEvent::Complete);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            UpgradeState::Done => {
                println!("{}", "upgrade complete".green().bold());
                return Ok(());
            }
            UpgradeState::Err => {
                return Err("upgrade failed: retry cap exceeded or device rejected the transfer".into());
            }
            UpgradeState::Idle => unreachable!("driven into Requesting before the loop starts"),
        }
    }
}

async fn cmd_capture(
    config: PathBuf,
    handle: &str,
    root: PathBuf,
    duration_secs: u64,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = parse_handle(handle)?;

    let runtime = load_runtime(config, RuntimeOptions::default()).await?;
    wait_ready(&runtime, handle, Duration::from_secs(wait_secs)).await?;

    if !runtime.start_debug_capture(handle, root).await {
        runtime.shutdown().await;
        return Err(format!("device {handle} is not known to the registry").into());
    }
    println!("{} capturing for {duration_secs}s", "●".red());
    tokio::time::sleep(Duration::from_secs(duration_secs)).await;
    runtime.stop_debug_capture(handle);
    println!("{}", "capture stopped".green());

    runtime.shutdown().await;
    Ok(())
}
