//! Discovery: periodic broadcast search and detection-reply handling
//! (spec §4.5, §4.6).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::command_ids::SEARCH;
use crate::family::FamilyContext;
use crate::framing::{CmdPacket, CmdType, SenderType};
use crate::handle::DeviceHandle;
use crate::ports::FamilyTag;
use crate::registry::DeviceRegistry;

/// Cadence of the detection broadcast (spec §4.5: "every second").
pub const SEARCH_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between firmware-type probe retries (spec §4.6 gives a retry cap
/// but not a cadence; this mirrors the command timeout so a failed probe
/// doesn't retry faster than an ack could plausibly arrive).
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Parsed `DetectionReply` payload (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionReply {
    pub ret_code: u8,
    pub dev_type: u8,
    pub serial_number: [u8; 16],
    pub lidar_ip: Ipv4Addr,
    pub cmd_port: u16,
}

impl DetectionReply {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 1 + 1 + 16 + 4 + 2 {
            return None;
        }
        let ret_code = bytes[0];
        let dev_type = bytes[1];
        let mut serial_number = [0u8; 16];
        serial_number.copy_from_slice(&bytes[2..18]);
        let lidar_ip = Ipv4Addr::new(bytes[18], bytes[19], bytes[20], bytes[21]);
        let cmd_port = u16::from_le_bytes([bytes[22], bytes[23]]);
        Some(Self { ret_code, dev_type, serial_number, lidar_ip, cmd_port })
    }

    #[must_use]
    pub fn serial_string(&self) -> String {
        let end = self.serial_number.iter().position(|&b| b == 0).unwrap_or(self.serial_number.len());
        String::from_utf8_lossy(&self.serial_number[..end]).to_string()
    }

    fn family_tag(&self) -> Option<FamilyTag> {
        match self.dev_type {
            0 => Some(FamilyTag::A),
            1 => Some(FamilyTag::B),
            _ => None,
        }
    }
}

/// Checks whether `candidate` is on the same /24 as `host_ip` (spec §4.5).
#[must_use]
pub fn same_slash_24(host_ip: Ipv4Addr, candidate: Ipv4Addr) -> bool {
    host_ip.octets()[..3] == candidate.octets()[..3]
}

/// Drives the broadcast loop and reply-handling side of device discovery.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    registry: Arc<DeviceRegistry>,
    /// Expected /24 of the configured host network, if a range was given.
    host_subnet: Option<Ipv4Addr>,
    detection_port: u16,
}

impl Discovery {
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, registry: Arc<DeviceRegistry>, host_subnet: Option<Ipv4Addr>, detection_port: u16) -> Self {
        Self { socket, registry, host_subnet, detection_port }
    }

    /// Broadcasts a `Search` command once, per spec §4.5.
    pub async fn broadcast_search(&self) -> std::io::Result<()> {
        let packet = CmdPacket {
            version: 1,
            seq_num: 0,
            cmd_id: SEARCH,
            cmd_type: CmdType::Cmd,
            sender_type: SenderType::Host,
            payload: &[],
        };
        let encoded = packet.encode().expect("empty payload never exceeds the frame limit");
        let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.detection_port);
        self.socket.send_to(&encoded, dest).await?;
        Ok(())
    }

    /// Spawns the once-per-second broadcast loop; runs until the returned
    /// handle is aborted.
    #[must_use]
    pub fn spawn_broadcast_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SEARCH_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = this.broadcast_search().await {
                    warn!(?err, "failed to broadcast detection search");
                }
            }
        })
    }

    /// Handles one detection-reply datagram. Admits the device into the
    /// registry if it is new and passes the /24 check (spec §4.5, §4.6).
    /// Returns the handle, family, and command port of a newly admitted
    /// device so the caller can kick off probing (spec §4.6); returns
    /// `None` for replies to an already-known device or a rejected reply.
    pub async fn on_reply(&self, data: &[u8]) -> Option<(DeviceHandle, FamilyTag, u16)> {
        let packet = match CmdPacket::parse(data) {
            Ok(p) => p,
            Err(err) => {
                debug!(?err, "dropped malformed detection packet");
                return None;
            }
        };
        if packet.cmd_id != SEARCH || packet.cmd_type != CmdType::Ack {
            return None;
        }
        let reply = DetectionReply::parse(packet.payload).or_else(|| {
            debug!("dropped undersized detection reply");
            None
        })?;
        if reply.ret_code != 0 {
            return None;
        }
        let tag = reply.family_tag().or_else(|| {
            debug!(dev_type = reply.dev_type, "unrecognized device type in detection reply");
            None
        })?;

        if let Some(host_subnet) = self.host_subnet {
            if !same_slash_24(host_subnet, reply.lidar_ip) {
                warn!(lidar_ip = %reply.lidar_ip, host_subnet = %host_subnet, "detection reply outside configured host subnet, not admitted");
                return None;
            }
        }

        let handle = DeviceHandle::from_ipv4(reply.lidar_ip);
        let is_new = self.registry.admit(handle, reply.serial_string(), tag, reply.cmd_port).await;
        if is_new {
            info!(%handle, serial = %reply.serial_string(), ?tag, "device admitted");
            Some((handle, tag, reply.cmd_port))
        } else {
            None
        }
    }
}

/// Runs the registry probe → configuration sequence for a newly admitted
/// device (spec §4.6). Intended to be spawned once per admitted device.
pub async fn probe_and_configure(
    registry: &DeviceRegistry,
    family: &FamilyContext,
    handle: DeviceHandle,
    cmd_port: u16,
    host_ip: Ipv4Addr,
    host_cmd_port: u16,
) {
    loop {
        match family.probe_fw_type(handle, cmd_port).await {
            Ok(is_loader) => {
                registry.resolve_probe(handle, is_loader).await;
                if is_loader {
                    debug!(%handle, "device reports loader mode, deferring configuration");
                    return;
                }
                break;
            }
            Err(_) => {
                if registry.record_probe_failure(handle).await {
                    warn!(%handle, "firmware-type probe failed ten times, assuming non-loader");
                    registry.resolve_probe(handle, false).await;
                    break;
                }
                tokio::time::sleep(PROBE_RETRY_DELAY).await;
            }
        }
    }

    if let Err(err) = family.update_device_config(handle, cmd_port, host_ip, host_cmd_port).await {
        warn!(%handle, ?err, "device configuration failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply(ret_code: u8, dev_type: u8) -> Vec<u8> {
        let mut payload = vec![ret_code, dev_type];
        payload.extend_from_slice(b"LD0001\0\0\0\0\0\0\0\0\0\0");
        payload.extend_from_slice(&[192, 168, 1, 101]);
        payload.extend_from_slice(&56000u16.to_le_bytes());
        payload
    }

    #[test]
    fn parses_well_formed_reply() {
        let payload = sample_reply(0, 1);
        let reply = DetectionReply::parse(&payload).unwrap();
        assert_eq!(reply.ret_code, 0);
        assert_eq!(reply.lidar_ip, Ipv4Addr::new(192, 168, 1, 101));
        assert_eq!(reply.cmd_port, 56000);
        assert_eq!(reply.serial_string(), "LD0001");
    }

    #[test]
    fn rejects_undersized_reply() {
        assert!(DetectionReply::parse(&[0, 1, 2, 3]).is_none());
    }

    #[test]
    fn slash_24_check_matches_same_subnet_only() {
        let host = Ipv4Addr::new(192, 168, 1, 50);
        assert!(same_slash_24(host, Ipv4Addr::new(192, 168, 1, 101)));
        assert!(!same_slash_24(host, Ipv4Addr::new(192, 168, 2, 101)));
    }
}
