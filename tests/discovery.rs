//! Detection broadcast reply handling, exercised without a real `Runtime`
//! so it never touches the hardcoded detection port (see
//! `tests/runtime_end_to_end.rs` for the full-stack scenarios).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;

use lidar_runtime::command_ids::{SEARCH, WORK_MODE_CONTROL};
use lidar_runtime::discovery::Discovery;
use lidar_runtime::framing::{CmdPacket, CmdType, SenderType};
use lidar_runtime::handle::DeviceHandle;
use lidar_runtime::ports::FamilyTag;
use lidar_runtime::registry::DeviceRegistry;

fn detection_reply_payload(serial: &str, dev_type: u8, lidar_ip: Ipv4Addr, cmd_port: u16) -> Vec<u8> {
    let mut payload = vec![0u8, dev_type]; // ret_code, dev_type
    let mut serial_bytes = [0u8; 16];
    let bytes = serial.as_bytes();
    serial_bytes[..bytes.len()].copy_from_slice(bytes);
    payload.extend_from_slice(&serial_bytes);
    payload.extend_from_slice(&lidar_ip.octets());
    payload.extend_from_slice(&cmd_port.to_le_bytes());
    payload
}

fn encode_search_ack(seq: u32, payload: &[u8]) -> Vec<u8> {
    CmdPacket {
        version: 1,
        seq_num: seq,
        cmd_id: SEARCH,
        cmd_type: CmdType::Ack,
        sender_type: SenderType::Device,
        payload,
    }
    .encode()
    .unwrap()
}

/// A socket bound to an OS-chosen port: `Discovery` never binds on its own,
/// so this is free of the shared-port collision risk `Runtime::init` has.
async fn idle_socket() -> Arc<UdpSocket> {
    Arc::new(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await.unwrap())
}

#[tokio::test]
async fn detection_reply_admits_new_device_exactly_once() {
    let socket = idle_socket().await;
    let registry = Arc::new(DeviceRegistry::new());
    let discovery = Discovery::new(socket, Arc::clone(&registry), None, 56000);

    let lidar_ip = Ipv4Addr::new(192, 168, 1, 101);
    let payload = detection_reply_payload("LD0001", 1, lidar_ip, 56100);
    let data = encode_search_ack(7, &payload);

    let admitted = discovery.on_reply(&data).await;
    let (handle, tag, cmd_port) = admitted.expect("first reply should admit the device");
    assert_eq!(handle, DeviceHandle::from_ipv4(lidar_ip));
    assert_eq!(tag, FamilyTag::B);
    assert_eq!(cmd_port, 56100);
    assert!(registry.contains(handle).await);

    // A repeat reply for the same handle is not a new admission.
    assert!(discovery.on_reply(&data).await.is_none());
}

#[tokio::test]
async fn reply_outside_configured_host_subnet_is_rejected() {
    let socket = idle_socket().await;
    let registry = Arc::new(DeviceRegistry::new());
    let host_subnet = Ipv4Addr::new(10, 0, 0, 1);
    let discovery = Discovery::new(socket, Arc::clone(&registry), Some(host_subnet), 56000);

    let lidar_ip = Ipv4Addr::new(192, 168, 1, 101);
    let payload = detection_reply_payload("LD0002", 0, lidar_ip, 56000);
    let data = encode_search_ack(1, &payload);

    assert!(discovery.on_reply(&data).await.is_none());
    assert!(!registry.contains(DeviceHandle::from_ipv4(lidar_ip)).await);
}

#[tokio::test]
async fn non_search_ack_traffic_is_ignored() {
    let socket = idle_socket().await;
    let registry = Arc::new(DeviceRegistry::new());
    let discovery = Discovery::new(socket, Arc::clone(&registry), None, 56000);

    let packet = CmdPacket {
        version: 1,
        seq_num: 1,
        cmd_id: WORK_MODE_CONTROL,
        cmd_type: CmdType::Ack,
        sender_type: SenderType::Device,
        payload: &[],
    };
    let data = packet.encode().unwrap();
    assert!(discovery.on_reply(&data).await.is_none());
}

#[tokio::test]
async fn malformed_reply_payload_is_dropped_without_admission() {
    let socket = idle_socket().await;
    let registry = Arc::new(DeviceRegistry::new());
    let discovery = Discovery::new(socket, Arc::clone(&registry), None, 56000);

    let undersized = encode_search_ack(1, &[0, 1, 2]);
    assert!(discovery.on_reply(&undersized).await.is_none());
}
