//! Socket fleet: binds host-side UDP sockets and partitions them into the
//! channel groups feeding each reactor (spec §4.4).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::info;

use crate::channel::ChannelKey;
use crate::config::{HostNetInfo, SdkConfig};
use crate::error::RuntimeError;
use crate::ports::{FamilyTag, DEBUG_CLOUD_PORT, DETECTION_PORT};
use crate::reactor::RegisteredSocket;

/// Which logical channel a bound host socket serves, used by the runtime
/// to route an inbound datagram once its local port is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneRole {
    Cmd,
    Push,
    Log,
    Point,
    Imu,
}

/// All sockets the runtime owns, already partitioned by plane. Detection is
/// kept separate from command/push/log, which is kept separate from
/// point/imu/debug-cloud, so that each can be handed to its own reactor
/// (spec §4.3's "three reactors, not one").
pub struct FleetSockets {
    pub detection: Vec<RegisteredSocket>,
    pub command_plane: Vec<RegisteredSocket>,
    pub data_plane: Vec<RegisteredSocket>,
    /// Maps each bound socket's key to the family and role it serves, so a
    /// reactor delegate can decide how to route a datagram purely from the
    /// local port it arrived on (spec §4.9's "purely by destination port").
    pub roles: HashMap<ChannelKey, (FamilyTag, PlaneRole)>,
    /// Key of the one shared debug point-cloud listener (spec §4.13), not
    /// present in `roles` since it isn't scoped to a single family.
    pub debug_cloud_key: ChannelKey,
}

/// `"local"` means "bind to all interfaces" (spec §4.4).
fn resolve_host_ip(host_ip: &str) -> Ipv4Addr {
    if host_ip.eq_ignore_ascii_case("local") {
        Ipv4Addr::UNSPECIFIED
    } else {
        host_ip.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

fn bind_udp(addr: SocketAddrV4, broadcast: bool) -> Result<UdpSocket, RuntimeError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
        RuntimeError::BindFailed { addr: SocketAddr::V4(addr), source }
    })?;
    socket.set_reuse_address(true).map_err(|source| RuntimeError::BindFailed {
        addr: SocketAddr::V4(addr),
        source,
    })?;
    if broadcast {
        socket.set_broadcast(true).map_err(|source| RuntimeError::BindFailed {
            addr: SocketAddr::V4(addr),
            source,
        })?;
    }
    socket.set_nonblocking(true).map_err(|source| RuntimeError::BindFailed {
        addr: SocketAddr::V4(addr),
        source,
    })?;
    socket.bind(&addr.into()).map_err(|source| RuntimeError::BindFailed {
        addr: SocketAddr::V4(addr),
        source,
    })?;
    UdpSocket::from_std(socket.into()).map_err(|source| RuntimeError::BindFailed {
        addr: SocketAddr::V4(addr),
        source,
    })
}

/// Joins a multicast group on the given socket if an address was configured.
fn maybe_join_multicast(socket: &UdpSocket, multicast_ip: Option<&str>, iface: Ipv4Addr) {
    let Some(mcast) = multicast_ip else { return };
    let Ok(mcast_addr) = mcast.parse::<Ipv4Addr>() else {
        return;
    };
    if let Err(err) = socket.join_multicast_v4(mcast_addr, iface) {
        tracing::warn!(%mcast_addr, ?err, "failed to join multicast group");
    }
}

pub struct SocketFleet;

impl SocketFleet {
    /// Binds every host-side socket named by `config` and, where the
    /// platform allows it, an extra broadcast listener on the detection
    /// port (spec §4.4).
    pub async fn build(config: &SdkConfig) -> Result<FleetSockets, RuntimeError> {
        let mut detection = Vec::new();
        let mut command_plane = Vec::new();
        let mut data_plane = Vec::new();
        let mut roles = HashMap::new();

        // One broadcast-capable detection socket per process, shared by all
        // families (they all speak on the well-known detection port).
        let detection_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DETECTION_PORT);
        let detection_socket = bind_udp(detection_addr, true)?;
        info!(addr = %detection_addr, "detection socket bound");
        detection.push(RegisteredSocket {
            key: ChannelKey::new(Ipv4Addr::UNSPECIFIED, DETECTION_PORT),
            socket: std::sync::Arc::new(detection_socket),
        });

        for (tag, family) in &config.families.0 {
            match &family.host_net_info {
                HostNetInfo::Single(info) => {
                    bind_family_host(
                        *tag,
                        &info.host_ip,
                        info.multicast_ip.as_deref(),
                        [
                            (PlaneRole::Cmd, info.cmd_data_port),
                            (PlaneRole::Push, info.push_msg_port),
                            (PlaneRole::Log, info.log_data_port),
                        ],
                        [
                            (PlaneRole::Point, info.point_data_port),
                            (PlaneRole::Imu, info.imu_data_port),
                        ],
                        &mut command_plane,
                        &mut data_plane,
                        &mut roles,
                    )?;
                }
                HostNetInfo::PerHost(entries) => {
                    for info in entries {
                        bind_family_host(
                            *tag,
                            &info.host_ip,
                            info.multicast_ip.as_deref(),
                            [
                                (PlaneRole::Cmd, info.cmd_data_port),
                                (PlaneRole::Push, info.push_msg_port),
                                (PlaneRole::Log, info.log_data_port),
                            ],
                            [
                                (PlaneRole::Point, info.point_data_port),
                                (PlaneRole::Imu, info.imu_data_port),
                            ],
                            &mut command_plane,
                            &mut data_plane,
                            &mut roles,
                        )?;
                    }
                }
            }
        }

        let debug_cloud_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEBUG_CLOUD_PORT);
        let debug_cloud_socket = bind_udp(debug_cloud_addr, false)?;
        info!(addr = %debug_cloud_addr, "debug point-cloud socket bound");
        let debug_cloud_key = ChannelKey::new(Ipv4Addr::UNSPECIFIED, DEBUG_CLOUD_PORT);
        data_plane.push(RegisteredSocket { key: debug_cloud_key, socket: std::sync::Arc::new(debug_cloud_socket) });

        Ok(FleetSockets { detection, command_plane, data_plane, roles, debug_cloud_key })
    }
}

#[allow(clippy::too_many_arguments)]
fn bind_family_host(
    tag: FamilyTag,
    host_ip: &str,
    multicast_ip: Option<&str>,
    cmd_ports: [(PlaneRole, u16); 3],
    data_ports: [(PlaneRole, u16); 2],
    command_plane: &mut Vec<RegisteredSocket>,
    data_plane: &mut Vec<RegisteredSocket>,
    roles: &mut HashMap<ChannelKey, (FamilyTag, PlaneRole)>,
) -> Result<(), RuntimeError> {
    let ip = resolve_host_ip(host_ip);

    for (role, port) in cmd_ports {
        let addr = SocketAddrV4::new(ip, port);
        let socket = bind_udp(addr, false)?;
        maybe_join_multicast(&socket, multicast_ip, ip);
        info!(?tag, ?role, addr = %addr, "command-plane socket bound");
        let key = ChannelKey::new(ip, port);
        command_plane.push(RegisteredSocket { key, socket: std::sync::Arc::new(socket) });
        roles.insert(key, (tag, role));
    }

    for (role, port) in data_ports {
        let addr = SocketAddrV4::new(ip, port);
        let socket = bind_udp(addr, false)?;
        maybe_join_multicast(&socket, multicast_ip, ip);
        info!(?tag, ?role, addr = %addr, "data-plane socket bound");
        let key = ChannelKey::new(ip, port);
        data_plane.push(RegisteredSocket { key, socket: std::sync::Arc::new(socket) });
        roles.insert(key, (tag, role));
    }

    Ok(())
}
