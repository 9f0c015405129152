//! Emulated LiDAR device used to exercise the runtime end to end without
//! real hardware: answers detection broadcasts, firmware-type probes, and
//! `WORK_MODE_CONTROL` configuration, then optionally streams push-state,
//! point-cloud, and log traffic at a host the caller names explicitly.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use lidar_runtime::command_ids::{
    COMPLETE_XFER_FIRMWARE, GET_INTERNAL_INFO, GET_UPGRADE_PROGRESS, PUSH_MSG, REBOOT, RESET,
    SEARCH, START_UPGRADE, WORK_MODE_CONTROL, XFER_FIRMWARE,
};
use lidar_runtime::family::{CONFIG_KEY_HOST_CMD_PORT, CONFIG_KEY_HOST_IP, PROBE_KEY_FW_TYPE};
use lidar_runtime::framing::{CmdPacket, CmdType, SenderType};
use lidar_runtime::state_info;
use lidar_runtime::tlv::{self, Param};

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Hap,
    Mid360,
}

impl Family {
    fn dev_type_byte(self) -> u8 {
        match self {
            Family::Hap => 0,
            Family::Mid360 => 1,
        }
    }

    fn default_cmd_port(self) -> u16 {
        match self {
            Family::Hap => 56000,
            Family::Mid360 => 56100,
        }
    }
}

#[derive(Parser)]
#[command(name = "lidar-sim", about = "Emulated LiDAR device for exercising lidar-runtime end to end")]
struct Cli {
    /// IPv4 address this emulated device pretends to be.
    #[arg(long, default_value = "192.168.1.101")]
    lidar_ip: Ipv4Addr,
    #[arg(long, default_value = "LD0001")]
    serial: String,
    #[arg(long, value_enum, default_value_t = Family::Mid360)]
    family: Family,
    #[arg(long, default_value_t = 56000)]
    detection_port: u16,
    /// Command-plane port to bind; defaults to the family's conventional port.
    #[arg(long)]
    cmd_port: Option<u16>,
    /// Host address to stream push-state/point-cloud traffic to; when unset
    /// those streams stay off.
    #[arg(long)]
    host_ip: Option<Ipv4Addr>,
    #[arg(long)]
    host_push_port: Option<u16>,
    #[arg(long)]
    host_point_port: Option<u16>,
}

fn bind_udp(addr: SocketAddrV4, broadcast: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cmd_port = cli.cmd_port.unwrap_or_else(|| cli.family.default_cmd_port());

    let detection_socket = bind_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cli.detection_port), true)?;
    let cmd_socket = bind_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cmd_port), false)?;

    info!(lidar_ip = %cli.lidar_ip, serial = %cli.serial, cmd_port, "lidar-sim listening");

    let upgrade_progress = Arc::new(AtomicU8::new(0));

    let detection_task = tokio::spawn(run_detection_loop(
        detection_socket,
        cli.lidar_ip,
        cli.serial.clone(),
        cli.family,
        cmd_port,
    ));
    let cmd_task = tokio::spawn(run_command_loop(cmd_socket, cli.serial.clone(), Arc::clone(&upgrade_progress)));

    let push_task = match (cli.host_ip, cli.host_push_port) {
        (Some(host_ip), Some(host_push_port)) => {
            Some(tokio::spawn(run_push_loop(cli.lidar_ip, host_ip, host_push_port, cli.serial.clone())))
        }
        _ => None,
    };
    let point_task = match (cli.host_ip, cli.host_point_port) {
        (Some(host_ip), Some(host_point_port)) => {
            Some(tokio::spawn(run_point_loop(cli.lidar_ip, host_ip, host_point_port)))
        }
        _ => None,
    };

    tokio::signal::ctrl_c().await?;
    detection_task.abort();
    cmd_task.abort();
    if let Some(task) = push_task {
        task.abort();
    }
    if let Some(task) = point_task {
        task.abort();
    }
    Ok(())
}

fn serial_bytes(serial: &str) -> [u8; 16] {
    let mut sn = [0u8; 16];
    let bytes = serial.as_bytes();
    let n = bytes.len().min(16);
    sn[..n].copy_from_slice(&bytes[..n]);
    sn
}

/// Answers `Search` broadcasts with a `DetectionReply` ack (spec §4.5).
async fn run_detection_loop(socket: UdpSocket, lidar_ip: Ipv4Addr, serial: String, family: Family, cmd_port: u16) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!(?err, "detection recv failed");
                continue;
            }
        };
        let Ok(packet) = CmdPacket::parse(&buf[..len]) else { continue };
        if packet.cmd_id != SEARCH || packet.cmd_type != CmdType::Cmd {
            continue;
        }

        let mut payload = Vec::with_capacity(24);
        payload.push(0); // ret_code
        payload.push(family.dev_type_byte());
        payload.extend_from_slice(&serial_bytes(&serial));
        payload.extend_from_slice(&lidar_ip.octets());
        payload.extend_from_slice(&cmd_port.to_le_bytes());

        let reply = CmdPacket {
            version: 1,
            seq_num: packet.seq_num,
            cmd_id: SEARCH,
            cmd_type: CmdType::Ack,
            sender_type: SenderType::Device,
            payload: &payload,
        };
        if let Ok(encoded) = reply.encode() {
            let _ = socket.send_to(&encoded, src).await;
        }
    }
}

fn ack_byte(code: u8) -> Vec<u8> {
    vec![code]
}

/// Answers firmware-type probes, configuration, reboot/reset, and the
/// firmware-upgrade command sequence, echoing success for anything else
/// (spec §4.6, §4.8, §4.12).
async fn run_command_loop(socket: UdpSocket, serial: String, progress: Arc<AtomicU8>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!(?err, "command recv failed");
                continue;
            }
        };
        let Ok(packet) = CmdPacket::parse(&buf[..len]) else { continue };
        if packet.cmd_type != CmdType::Cmd {
            continue;
        }

        let reply_payload = match packet.cmd_id {
            GET_INTERNAL_INFO => tlv::pack(&[Param { key: PROBE_KEY_FW_TYPE, value: &[0] }]),
            WORK_MODE_CONTROL => {
                handle_work_mode_control(packet.payload);
                vec![0, 0] // ret_code, error_key
            }
            REBOOT | RESET => Vec::new(),
            START_UPGRADE => {
                progress.store(0, Ordering::Relaxed);
                ack_byte(0)
            }
            XFER_FIRMWARE => ack_byte(0),
            COMPLETE_XFER_FIRMWARE => ack_byte(0),
            GET_UPGRADE_PROGRESS => {
                let next = (progress.fetch_add(50, Ordering::Relaxed) + 50).min(100);
                ack_byte(next)
            }
            other => {
                info!(cmd_id = other, "acking unrecognized command with success");
                ack_byte(0)
            }
        };

        let reply = CmdPacket {
            version: 1,
            seq_num: packet.seq_num,
            cmd_id: packet.cmd_id,
            cmd_type: CmdType::Ack,
            sender_type: SenderType::Device,
            payload: &reply_payload,
        };
        if let Ok(encoded) = reply.encode() {
            let _ = socket.send_to(&encoded, src).await;
        }
        let _ = &serial;
    }
}

fn handle_work_mode_control(payload: &[u8]) {
    let Ok(params) = tlv::parse(payload) else { return };
    let mut host_ip = None;
    let mut host_cmd_port = None;
    for p in params {
        match p.key {
            CONFIG_KEY_HOST_IP if p.value.len() == 4 => {
                host_ip = Some(Ipv4Addr::new(p.value[0], p.value[1], p.value[2], p.value[3]));
            }
            CONFIG_KEY_HOST_CMD_PORT if p.value.len() == 2 => {
                host_cmd_port = Some(u16::from_le_bytes([p.value[0], p.value[1]]));
            }
            _ => {}
        }
    }
    info!(?host_ip, ?host_cmd_port, "device configured by host");
}

/// Streams a push-state message every two seconds (spec §4.10). The host
/// recognizes push traffic by which of its own sockets the datagram
/// arrives on, so this socket's own port is just an ephemeral one.
async fn run_push_loop(lidar_ip: Ipv4Addr, host_ip: Ipv4Addr, host_push_port: u16, serial: String) {
    let socket = match bind_udp(SocketAddrV4::new(lidar_ip, 0), false) {
        Ok(s) => s,
        Err(err) => {
            warn!(?err, "failed to bind push-state socket");
            return;
        }
    };
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    let mut seq: u32 = 0;
    loop {
        interval.tick().await;
        let payload = tlv::pack(&[
            Param { key: state_info::KEY_SN, value: serial.as_bytes() },
            Param { key: state_info::KEY_CUR_WORK_STATE, value: &[1] },
            Param { key: state_info::KEY_CORE_TEMP, value: &35i32.to_le_bytes() },
        ]);
        let packet = CmdPacket {
            version: 1,
            seq_num: seq,
            cmd_id: PUSH_MSG,
            cmd_type: CmdType::Cmd,
            sender_type: SenderType::Device,
            payload: &payload,
        };
        seq = seq.wrapping_add(1);
        if let Ok(encoded) = packet.encode() {
            let dest: SocketAddr = SocketAddrV4::new(host_ip, host_push_port).into();
            let _ = socket.send_to(&encoded, dest).await;
        }
    }
}

/// Streams raw (unframed) point-cloud-shaped datagrams once a second, for
/// exercising [`lidar_runtime::router::DataRouter`] without real hardware.
async fn run_point_loop(lidar_ip: Ipv4Addr, host_ip: Ipv4Addr, host_point_port: u16) {
    let socket = match bind_udp(SocketAddrV4::new(lidar_ip, 0), false) {
        Ok(s) => s,
        Err(err) => {
            warn!(?err, "failed to bind point-cloud socket");
            return;
        }
    };
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut frame: u32 = 0;
    loop {
        interval.tick().await;
        let mut payload = frame.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0xAB; 32]);
        frame = frame.wrapping_add(1);
        let dest: SocketAddr = SocketAddrV4::new(host_ip, host_point_port).into();
        let _ = socket.send_to(&payload, dest).await;
    }
}
