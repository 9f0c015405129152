//! Per-family command handler (spec §4.8).
//!
//! Two concrete families share one contract — `handle`, `update_device_config`,
//! `send` — and differ only in port tables and small
//! payload-framing quirks. The quirks are captured by the
//! [`FamilyHandler`] trait (object-safe, synchronous: it only ever shapes
//! bytes); the shared async I/O — socket selection, correlator
//! registration, ack/timeout waiting — lives once on [`FamilyContext`]
//! rather than being duplicated per family.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::command_ids::{GET_INTERNAL_INFO, PUSH_MSG, WORK_MODE_CONTROL};
use crate::correlator::{await_outcome, CommandCorrelator, CommandOutcome};
use crate::error::{CommandError, FramingError};
use crate::framing::{CmdPacket, CmdType, SenderType};
use crate::handle::DeviceHandle;
use crate::ports::{FamilyTag, HostPorts};
use crate::registry::DeviceRegistry;
use crate::seq::SequenceGenerator;
use crate::state_info::DeviceStateInfo;
use crate::tlv::{self, Param};

/// TLV key asking for the single `kKeyFwType` value during probing
/// (spec §4.6). Kept distinct from [`crate::command_ids::KEY_FW_TYPE`]'s
/// module doc for readability; same convention applies.
pub const PROBE_KEY_FW_TYPE: u16 = 0x0000;

pub const CONFIG_KEY_HOST_IP: u16 = 0x0001;
pub const CONFIG_KEY_HOST_CMD_PORT: u16 = 0x0002;
pub const CONFIG_KEY_HOST_POINT_PORT: u16 = 0x0003;
pub const CONFIG_KEY_HOST_IMU_PORT: u16 = 0x0004;
pub const CONFIG_KEY_HOST_LOG_PORT: u16 = 0x0005;

/// Delivers a rendered push-state JSON string to user code (spec §4.8,
/// §4.10's "user info callback").
pub type InfoCallback = Arc<dyn Fn(DeviceHandle, FamilyTag, String) + Send + Sync>;

/// Sees every received command packet verbatim; used by conformance
/// tooling (spec §4.9).
pub type RawObserver = Arc<dyn Fn(DeviceHandle, SocketAddrV4, &[u8]) + Send + Sync>;

/// The part of a family's behaviour that is pure byte-shaping, not I/O.
/// Kept object-safe so a [`FamilyContext`] can hold either variant behind
/// one `Arc<dyn FamilyHandler>`.
pub trait FamilyHandler: Send + Sync {
    fn tag(&self) -> FamilyTag;

    /// Builds the `WorkModeControl` TLV payload used for first-time
    /// device configuration (spec §4.8). Family B additionally hands over
    /// its separate point/IMU/log host ports; family A multiplexes all of
    /// those onto the single shared port already carried by `host_cmd_port`.
    fn encode_device_config(&self, host_ip: Ipv4Addr, host_cmd_port: u16) -> Vec<u8>;

    /// True if a packet arriving on `src_port` is this family's push-state
    /// channel (spec §4.8).
    fn is_push_port(&self, src_port: u16) -> bool;
}

pub struct FamilyA {
    pub host_ports: HostPorts,
}

impl FamilyHandler for FamilyA {
    fn tag(&self) -> FamilyTag {
        FamilyTag::A
    }

    fn encode_device_config(&self, host_ip: Ipv4Addr, host_cmd_port: u16) -> Vec<u8> {
        tlv::pack(&[
            Param { key: CONFIG_KEY_HOST_IP, value: &host_ip.octets() },
            Param { key: CONFIG_KEY_HOST_CMD_PORT, value: &host_cmd_port.to_le_bytes() },
        ])
    }

    fn is_push_port(&self, src_port: u16) -> bool {
        src_port == self.host_ports.push
    }
}

pub struct FamilyB {
    pub host_ports: HostPorts,
}

impl FamilyHandler for FamilyB {
    fn tag(&self) -> FamilyTag {
        FamilyTag::B
    }

    fn encode_device_config(&self, host_ip: Ipv4Addr, host_cmd_port: u16) -> Vec<u8> {
        let point_port = self.host_ports.point.to_le_bytes();
        let imu_port = self.host_ports.imu.to_le_bytes();
        let log_port = self.host_ports.log.to_le_bytes();
        tlv::pack(&[
            Param { key: CONFIG_KEY_HOST_IP, value: &host_ip.octets() },
            Param { key: CONFIG_KEY_HOST_CMD_PORT, value: &host_cmd_port.to_le_bytes() },
            Param { key: CONFIG_KEY_HOST_POINT_PORT, value: &point_port },
            Param { key: CONFIG_KEY_HOST_IMU_PORT, value: &imu_port },
            Param { key: CONFIG_KEY_HOST_LOG_PORT, value: &log_port },
        ])
    }

    fn is_push_port(&self, src_port: u16) -> bool {
        src_port == self.host_ports.push
    }
}

/// Shared async behaviour closing over one family's sockets and handler.
pub struct FamilyContext {
    pub handler: Arc<dyn FamilyHandler>,
    pub registry: Arc<DeviceRegistry>,
    pub correlator: Arc<CommandCorrelator>,
    pub seq: Arc<SequenceGenerator>,
    pub cmd_socket: Arc<UdpSocket>,
    pub log_socket: Arc<UdpSocket>,
    pub info_callback: InfoCallback,
    pub raw_observer: Option<RawObserver>,
    pub timeout: Duration,
}

impl FamilyContext {
    /// Ingress entry point (spec §4.8 `handle`). Dispatches acks to the
    /// correlator and recognizes push-state commands arriving on this
    /// family's push port.
    ///
    /// `is_push_channel` tells this call which *local* host socket the
    /// datagram arrived on (spec §4.9: routing is decided purely by local
    /// destination port, never by the sender's ephemeral source port — a
    /// device's outbound push messages have no fixed source port).
    pub async fn handle(&self, device_ip: Ipv4Addr, src_port: u16, is_push_channel: bool, data: &[u8]) {
        if let Some(observer) = &self.raw_observer {
            observer(DeviceHandle::from_ipv4(device_ip), SocketAddrV4::new(device_ip, src_port), data);
        }

        let packet = match CmdPacket::parse(data) {
            Ok(p) => p,
            Err(err) => {
                debug!(?err, "dropped malformed packet");
                return;
            }
        };

        match packet.cmd_type {
            CmdType::Ack => {
                self.correlator.complete(packet.seq_num as u16, packet.payload.to_vec()).await;
            }
            CmdType::Cmd if packet.cmd_id == PUSH_MSG && is_push_channel => {
                self.deliver_push_state(device_ip, packet.payload);
            }
            CmdType::Cmd => {
                trace!(cmd_id = packet.cmd_id, "ignoring unsolicited command on non-push channel");
            }
        }
    }

    fn deliver_push_state(&self, device_ip: Ipv4Addr, payload: &[u8]) {
        let params = match tlv::parse(payload) {
            Ok(p) => p,
            Err(err) => {
                warn!(?err, "malformed push-state TLV");
                return;
            }
        };
        let info = DeviceStateInfo::from_tlv(&params);
        match info.to_json() {
            Ok(json) => {
                let handle = DeviceHandle::from_ipv4(device_ip);
                (self.info_callback)(handle, self.handler.tag(), json);
            }
            Err(err) => warn!(?err, "failed to render push-state JSON"),
        }
    }

    /// First-time configuration builder (spec §4.8 `update_device_config`).
    /// On a `ret_code == 0` ack, marks the device ready and fires the
    /// info-change callback exactly once (spec §4.6).
    pub async fn update_device_config(
        &self,
        handle: DeviceHandle,
        cmd_port: u16,
        host_ip: Ipv4Addr,
        host_cmd_port: u16,
    ) -> Result<(), CommandError> {
        let payload = self.handler.encode_device_config(host_ip, host_cmd_port);
        let ack = self.send(handle, cmd_port, WORK_MODE_CONTROL, payload).await?;

        let ret_code = ack.first().copied().unwrap_or(1);
        let error_key = ack.get(1).copied().unwrap_or(1);
        if ret_code == 0 && error_key == 0 {
            self.registry.update(handle, |record| record.config_applied = true).await;
            if self.registry.mark_ready_once(handle).await {
                if let Ok(json) = DeviceStateInfo::default().to_json() {
                    (self.info_callback)(handle, self.handler.tag(), json);
                }
            }
            Ok(())
        } else {
            Err(CommandError::SendFailed(format!(
                "device rejected configuration: ret_code={ret_code} error_key={error_key}"
            )))
        }
    }

    /// Probes `kKeyFwType` (spec §4.6); `Ok(true)` means loader mode.
    pub async fn probe_fw_type(&self, handle: DeviceHandle, cmd_port: u16) -> Result<bool, CommandError> {
        let payload = tlv::pack(&[Param { key: PROBE_KEY_FW_TYPE, value: &[] }]);
        let ack = self.send(handle, cmd_port, GET_INTERNAL_INFO, payload).await?;
        let params = tlv::parse(&ack).map_err(|err| CommandError::SendFailed(err.to_string()))?;
        let value = params
            .iter()
            .find(|p| p.key == PROBE_KEY_FW_TYPE)
            .and_then(|p| p.value.first().copied())
            .ok_or_else(|| CommandError::SendFailed("missing fw_type in probe reply".into()))?;
        Ok(value == 0)
    }

    /// Sends a command on the command-plane socket and waits for its ack
    /// or timeout (spec §4.8 `send`).
    pub async fn send(&self, handle: DeviceHandle, cmd_port: u16, cmd_id: u16, payload: Vec<u8>) -> Result<Vec<u8>, CommandError> {
        self.send_on(&self.cmd_socket, handle, cmd_port, cmd_id, payload).await
    }

    async fn send_on(
        &self,
        socket: &UdpSocket,
        handle: DeviceHandle,
        dest_port: u16,
        cmd_id: u16,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CommandError> {
        let seq = self.seq.next();
        let packet = CmdPacket {
            version: 1,
            seq_num: u32::from(seq),
            cmd_id,
            cmd_type: CmdType::Cmd,
            sender_type: SenderType::Host,
            payload: &payload,
        };
        let encoded = packet.encode().map_err(|err: FramingError| CommandError::SendFailed(err.to_string()))?;

        // Register before sending: an ack racing the send must never be
        // dropped for arriving before registration completes.
        let rx = self.correlator.register(seq, self.timeout).await;

        let dest = SocketAddrV4::new(handle.to_ipv4(), dest_port);
        socket
            .send_to(&encoded, dest)
            .await
            .map_err(|err| CommandError::SendFailed(err.to_string()))?;

        match await_outcome(rx).await? {
            CommandOutcome::Success(payload) => Ok(payload),
            CommandOutcome::Timeout => Err(CommandError::Timeout),
        }
    }
}
