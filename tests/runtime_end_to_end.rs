//! Full-stack scenarios driven against a real [`Runtime`]: command ack,
//! command timeout, log create/transfer/end, and the firmware upgrade
//! happy path.
//!
//! `Runtime::init` always binds the shared detection socket on the
//! hardcoded detection port, so this file holds exactly one `#[tokio::test]`
//! — a second `Runtime` anywhere in this binary would race it for that
//! port. Every other scenario in the suite avoids `Runtime::init` entirely
//! (see `tests/discovery.rs` and `tests/log_cache_eviction.rs`).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use lidar_runtime::command_ids::{
    COMPLETE_XFER_FIRMWARE, GET_UPGRADE_PROGRESS, PUSH_LOG, REBOOT, START_UPGRADE, XFER_FIRMWARE,
};
use lidar_runtime::config::SdkConfig;
use lidar_runtime::error::CommandError;
use lidar_runtime::framing::{CmdPacket, CmdType, SenderType};
use lidar_runtime::handle::DeviceHandle;
use lidar_runtime::ports::FamilyTag;
use lidar_runtime::upgrade::{UpgradeAckCode, UpgradeEvent, UpgradeSession, UpgradeState};
use lidar_runtime::{Runtime, RuntimeOptions};

/// A minimal stand-in for `lidar-sim`'s command loop, just enough to answer
/// the commands this test drives.
async fn run_emulated_device(socket: UdpSocket, progress: Arc<AtomicU8>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let Ok((len, src)) = socket.recv_from(&mut buf).await else { continue };
        let Ok(packet) = CmdPacket::parse(&buf[..len]) else { continue };
        if packet.cmd_type != CmdType::Cmd {
            continue;
        }

        let reply_payload: Vec<u8> = match packet.cmd_id {
            REBOOT => vec![0x00],
            START_UPGRADE => {
                progress.store(0, Ordering::Relaxed);
                vec![0]
            }
            XFER_FIRMWARE | COMPLETE_XFER_FIRMWARE => vec![0],
            GET_UPGRADE_PROGRESS => {
                let next = (progress.fetch_add(50, Ordering::Relaxed) + 50).min(100);
                vec![next]
            }
            _ => vec![0],
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
    }
}

fn ack_code(byte: u8) -> UpgradeAckCode {
    match byte {
        0 => UpgradeAckCode::Ok,
        1 => UpgradeAckCode::SystemIsNotReady,
        2 => UpgradeAckCode::EraseFirmware,
        _ => UpgradeAckCode::Other,
    }
}

/// Mirrors `lidar-host`'s upgrade driver loop against a live [`Runtime`].
async fn drive_upgrade(runtime: &Runtime, handle: DeviceHandle, firmware: Vec<u8>) -> Result<(), CommandError> {
    let mut session = UpgradeSession::new(firmware);
    session.apply(UpgradeEvent::RequestUpgrade);
    loop {
        match session.state {
            UpgradeState::Requesting => {
                let ack = runtime.send_command(handle, START_UPGRADE, vec![]).await?;
                session.apply(UpgradeSession::event_for_ack(ack_code(ack.first().copied().unwrap_or(0xFF))));
            }
            UpgradeState::Transferring => {
                let Some(chunk) = session.next_chunk().map(<[u8]>::to_vec) else {
                    session.apply(UpgradeEvent::CompleteXfer);
                    continue;
                };
                let ack = runtime.send_command(handle, XFER_FIRMWARE, chunk).await?;
                let code = ack_code(ack.first().copied().unwrap_or(0xFF));
                if matches!(code, UpgradeAckCode::Ok) {
                    session.advance_chunk();
                    if session.is_transfer_complete() {
                        session.apply(UpgradeEvent::CompleteXfer);
                    } else {
                        session.apply(UpgradeEvent::XferFirmware);
                    }
                } else {
                    session.apply(UpgradeSession::event_for_ack(code));
                }
            }
            UpgradeState::Completing => {
                runtime.send_command(handle, COMPLETE_XFER_FIRMWARE, vec![]).await?;
                session.apply(UpgradeEvent::GetProgress { progress: 0 });
            }
            UpgradeState::Polling => {
                let ack = runtime.send_command(handle, GET_UPGRADE_PROGRESS, vec![]).await?;
                let progress = ack.first().copied().unwrap_or(0);
                if progress >= 100 {
                    session.apply(UpgradeEvent::Complete);
                } else {
                    session.apply(UpgradeEvent::GetProgress { progress });
                }
            }
            UpgradeState::Done => return Ok(()),
            UpgradeState::Err => return Err(CommandError::SendFailed("upgrade session entered Err state".into())),
            UpgradeState::Idle => unreachable!("RequestUpgrade always leaves Idle"),
        }
    }
}

fn log_header(log_type: u8, flag: u8, trans_index: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    buf[0] = log_type;
    buf[1] = 0; // file_index
    buf[2] = 1; // file_num
    buf[3] = flag;
    buf[10..14].copy_from_slice(&trans_index.to_le_bytes());
    buf[14..16].copy_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

fn push_log_packet(seq: u32, payload: &[u8]) -> Vec<u8> {
    CmdPacket {
        version: 1,
        seq_num: seq,
        cmd_id: PUSH_LOG,
        cmd_type: CmdType::Cmd,
        sender_type: SenderType::Device,
        payload,
    }
    .encode()
    .unwrap()
}

#[tokio::test]
async fn command_ack_timeout_log_ingestion_and_upgrade() {
    let log_root = tempfile::tempdir().unwrap();
    let config_json = format!(
        r#"{{
            "master_sdk": true,
            "lidar_log_enable": true,
            "lidar_log_cache_size_MB": 1,
            "lidar_log_path": "{path}",
            "MID360": {{
                "lidar_net_info": {{
                    "cmd_data_port": 58100, "push_msg_port": 58200,
                    "point_data_port": 58300, "imu_data_port": 58400,
                    "log_data_port": 58500
                }},
                "host_net_info": {{
                    "host_ip": "127.0.0.1",
                    "cmd_data_port": 58101, "push_msg_port": 58201,
                    "point_data_port": 58301, "imu_data_port": 58401,
                    "log_data_port": 58501
                }}
            }}
        }}"#,
        path = log_root.path().display()
    );
    let config = SdkConfig::parse(&config_json).unwrap();

    let options = RuntimeOptions { command_timeout: Duration::from_millis(250), ..RuntimeOptions::default() };
    let runtime = Runtime::init(config, options).await.unwrap();

    // A real device, reachable on loopback, answering on the cmd port the
    // config's host socket talks to.
    let device_handle = DeviceHandle::from_ipv4(Ipv4Addr::new(127, 0, 0, 1));
    assert!(runtime.registry.admit(device_handle, "LD0001".to_string(), FamilyTag::B, 58100).await);
    let device_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 58100)).await.unwrap();
    let progress = Arc::new(AtomicU8::new(0));
    let device_task = tokio::spawn(run_emulated_device(device_socket, Arc::clone(&progress)));

    // A second handle admitted with no listener behind it, to exercise the
    // timeout path without interfering with the real device above.
    let unreachable_handle = DeviceHandle::from_ipv4(Ipv4Addr::new(127, 0, 0, 2));
    assert!(runtime.registry.admit(unreachable_handle, "LD0002".to_string(), FamilyTag::B, 58199).await);

    // --- command ack ---
    let ack = runtime.send_command(device_handle, REBOOT, vec![]).await.unwrap();
    assert_eq!(ack, vec![0x00]);

    // --- command timeout ---
    let err = runtime.send_command(unreachable_handle, REBOOT, vec![]).await.unwrap_err();
    assert!(matches!(err, CommandError::Timeout));

    // --- log create / transfer / end ---
    let log_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 0)).await.unwrap();
    let host_log_addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 58501);

    const FLAG_CREATE_FILE: u8 = 0b0000_0010;
    const FLAG_END_FILE: u8 = 0b0000_0100;

    let create = push_log_packet(1, &log_header(0, FLAG_CREATE_FILE, 0, b""));
    log_socket.send_to(&create, host_log_addr).await.unwrap();
    let transfer = push_log_packet(2, &log_header(0, 0, 1, b"hello from the device"));
    log_socket.send_to(&transfer, host_log_addr).await.unwrap();
    let end = push_log_packet(3, &log_header(0, FLAG_END_FILE, 2, b""));
    log_socket.send_to(&end, host_log_addr).await.unwrap();

    let type_0_dir = log_root.path().join("lidar_log").join("type_0");
    let mut final_file_seen = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !type_0_dir.exists() {
            continue;
        }
        let mut entries = tokio::fs::read_dir(&type_0_dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                final_file_seen = true;
            }
        }
        if final_file_seen {
            break;
        }
    }
    assert!(final_file_seen, "expected a closed (non dot-prefixed) log file under lidar_log/type_0");

    // --- firmware upgrade happy path ---
    let firmware = vec![0xABu8; 2500]; // three 1024-byte chunks
    drive_upgrade(&runtime, device_handle, firmware).await.unwrap();

    device_task.abort();
    runtime.shutdown().await;
}
