//! Top-level wiring: binds every socket, starts every background task, and
//! exposes the one entry point user code drives (spec §4, §5, §9).
//!
//! Three [`Reactor`] groups are spawned — detection, command-plane,
//! data-plane — each with its own [`ReactorDelegate`]. A delegate's
//! `on_packet`/`on_tick` are synchronous (the reactor must never block on
//! one socket's handling), so every delegate here does real work by
//! `tokio::spawn`-ing it and returning immediately.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command_ids::PUSH_LOG;
use crate::config::{compute_log_cache_budgets, HostNetInfo, SdkConfig};
use crate::correlator::{CommandCorrelator, DEFAULT_TIMEOUT};
use crate::debug_cloud::{CaptureChunk, DebugCloudSink};
use crate::discovery::{self, Discovery};
use crate::error::RuntimeError;
use crate::family::{FamilyA, FamilyB, FamilyContext, FamilyHandler, InfoCallback, RawObserver};
use crate::framing::{CmdPacket, CmdType, SenderType};
use crate::handle::DeviceHandle;
use crate::logger::cache::spawn_eviction_loop;
use crate::logger::{LogIngestor, PushLogHeader};
use crate::ports::{FamilyTag, HostPorts};
use crate::reactor::{Reactor, ReactorDelegate, RegisteredSocket};
use crate::registry::DeviceRegistry;
use crate::router::{Channel, DataRouter};
use crate::seq::SequenceGenerator;
use crate::socket_fleet::{FleetSockets, PlaneRole, SocketFleet};
use crate::channel::ChannelKey;

/// User-supplied hooks and knobs that aren't part of the JSON config
/// (spec §5): the info-change callback, an optional raw-packet observer for
/// conformance tooling, and the command ack timeout.
pub struct RuntimeOptions {
    pub info_callback: InfoCallback,
    pub raw_observer: Option<RawObserver>,
    pub command_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            info_callback: Arc::new(|_, _, _| {}),
            raw_observer: None,
            command_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A family's resolved host endpoint, used once a device is admitted to
/// drive its probe/configure sequence (spec §4.6).
#[derive(Debug, Clone, Copy)]
struct HostEndpoint {
    host_ip: Ipv4Addr,
    host_cmd_port: u16,
}

/// Everything one running process owns (spec §4's "one process owns every
/// socket and background task").
pub struct Runtime {
    pub registry: Arc<DeviceRegistry>,
    pub correlator: Arc<CommandCorrelator>,
    pub router: Arc<DataRouter>,
    pub log_ingestor: Arc<LogIngestor>,
    pub discovery: Arc<Discovery>,
    families: HashMap<FamilyTag, Arc<FamilyContext>>,
    debug_sinks: Arc<StdMutex<HashMap<DeviceHandle, DebugCloudSink>>>,
    reactors: Vec<Reactor>,
    background: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Binds sockets, wires every component, and starts every background
    /// loop (broadcast search, log cache eviction, the three reactors).
    pub async fn init(config: SdkConfig, options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let registry = Arc::new(DeviceRegistry::new());
        let correlator = Arc::new(CommandCorrelator::new());
        let seq = Arc::new(SequenceGenerator::new());
        let router = Arc::new(DataRouter::new());
        let log_root = PathBuf::from(&config.logger.lidar_log_path);
        let log_ingestor = Arc::new(LogIngestor::new(log_root.clone()));
        log_ingestor
            .recover_dot_files()
            .await
            .map_err(|source| RuntimeError::DirCreateFailed { path: log_root.display().to_string(), source })?;
        let eviction_signal = Arc::new(Notify::new());
        let debug_sinks = Arc::new(StdMutex::new(HashMap::new()));

        let fleet = SocketFleet::build(&config).await?;

        let (families, host_endpoints) = build_families(
            &config,
            &fleet,
            Arc::clone(&registry),
            Arc::clone(&correlator),
            Arc::clone(&seq),
            options.info_callback,
            options.raw_observer,
            options.command_timeout,
        )?;

        let detection_socket = Arc::clone(&fleet.detection[0].socket);
        let discovery = Arc::new(Discovery::new(
            Arc::clone(&detection_socket),
            Arc::clone(&registry),
            None,
            crate::ports::DETECTION_PORT,
        ));

        let mut background = Vec::new();
        background.push(discovery.spawn_broadcast_loop());

        if config.logger.lidar_log_enable {
            let budgets = compute_log_cache_budgets(config.logger.lidar_log_cache_size_mb);
            background.push(spawn_eviction_loop(log_root, budgets, Arc::clone(&eviction_signal)));
        }

        let mut reactors = Vec::with_capacity(3);

        let detection_delegate: Arc<dyn ReactorDelegate> = Arc::new(DetectionDelegate {
            discovery: Arc::clone(&discovery),
            registry: Arc::clone(&registry),
            families: families.clone(),
            host_endpoints: host_endpoints.clone(),
        });
        reactors.push(Reactor::spawn("detection", fleet.detection, detection_delegate, Duration::from_millis(100)));

        let log_sockets: HashMap<ChannelKey, Arc<UdpSocket>> = fleet
            .command_plane
            .iter()
            .filter(|reg| matches!(fleet.roles.get(&reg.key), Some((_, PlaneRole::Log))))
            .map(|reg| (reg.key, Arc::clone(&reg.socket)))
            .collect();
        let command_delegate: Arc<dyn ReactorDelegate> = Arc::new(CommandPlaneDelegate {
            roles: fleet.roles.clone(),
            families: families.clone(),
            log_ingestor: Arc::clone(&log_ingestor),
            log_sockets,
            registry: Arc::clone(&registry),
            eviction_signal: Arc::clone(&eviction_signal),
            correlator: Arc::clone(&correlator),
        });
        reactors.push(Reactor::spawn("command-plane", fleet.command_plane, command_delegate, Duration::from_millis(100)));

        let data_delegate: Arc<dyn ReactorDelegate> = Arc::new(DataPlaneDelegate {
            roles: fleet.roles.clone(),
            debug_cloud_key: fleet.debug_cloud_key,
            router: Arc::clone(&router),
            debug_sinks: Arc::clone(&debug_sinks),
        });
        reactors.push(Reactor::spawn("data-plane", fleet.data_plane, data_delegate, Duration::from_millis(100)));

        info!("runtime initialized");

        Ok(Self {
            registry,
            correlator,
            router,
            log_ingestor,
            discovery,
            families,
            debug_sinks,
            reactors,
            background,
        })
    }

    /// Issues one device's command/response for a raw TLV payload (spec
    /// §4.8). Exposed for the CLI and for commands (reboot, reset, upgrade
    /// control messages) that don't need their own dedicated method.
    pub async fn send_command(&self, handle: DeviceHandle, cmd_id: u16, payload: Vec<u8>) -> Result<Vec<u8>, crate::error::CommandError> {
        let record = self
            .registry
            .get(handle)
            .await
            .ok_or(crate::error::CommandError::InvalidHandle(handle))?;
        let family = self
            .families
            .get(&record.device_type)
            .ok_or(crate::error::CommandError::ChannelMissing)?;
        family.send(handle, record.cmd_port, cmd_id, payload).await
    }

    /// Starts capturing raw point-cloud datagrams for `handle` to disk
    /// (spec §4.13). Returns `false` if the handle is unknown.
    pub async fn start_debug_capture(&self, handle: DeviceHandle, root: PathBuf) -> bool {
        let Some(record) = self.registry.get(handle).await else { return false };
        let dev_type = match record.device_type {
            FamilyTag::A => 0,
            FamilyTag::B => 1,
        };
        let sink = DebugCloudSink::spawn(root, dev_type, record.serial_number.clone(), handle);
        self.debug_sinks.lock().unwrap().insert(handle, sink);
        true
    }

    pub fn stop_debug_capture(&self, handle: DeviceHandle) {
        self.debug_sinks.lock().unwrap().remove(&handle);
    }

    /// Stops every reactor and background task, waiting for clean exit.
    pub async fn shutdown(self) {
        for handle in self.background {
            handle.abort();
        }
        for reactor in self.reactors {
            reactor.shutdown().await;
        }
        info!("runtime shut down");
    }
}

#[allow(clippy::too_many_arguments)]
fn build_families(
    config: &SdkConfig,
    fleet: &FleetSockets,
    registry: Arc<DeviceRegistry>,
    correlator: Arc<CommandCorrelator>,
    seq: Arc<SequenceGenerator>,
    info_callback: InfoCallback,
    raw_observer: Option<RawObserver>,
    timeout: Duration,
) -> Result<(HashMap<FamilyTag, Arc<FamilyContext>>, HashMap<FamilyTag, HostEndpoint>), RuntimeError> {
    let mut families = HashMap::new();
    let mut host_endpoints = HashMap::new();

    for (tag, family_cfg) in &config.families.0 {
        let (host_ip_str, cmd_port, push_port, point_port, imu_port, log_port) = match &family_cfg.host_net_info {
            HostNetInfo::Single(info) => (
                info.host_ip.clone(),
                info.cmd_data_port,
                info.push_msg_port,
                info.point_data_port,
                info.imu_data_port,
                info.log_data_port,
            ),
            HostNetInfo::PerHost(entries) => {
                let Some(first) = entries.first() else { continue };
                (
                    first.host_ip.clone(),
                    first.cmd_data_port,
                    first.push_msg_port,
                    first.point_data_port,
                    first.imu_data_port,
                    first.log_data_port,
                )
            }
        };

        let ip = if host_ip_str.eq_ignore_ascii_case("local") {
            Ipv4Addr::UNSPECIFIED
        } else {
            host_ip_str.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
        };

        let cmd_key = ChannelKey::new(ip, cmd_port);
        let log_key = ChannelKey::new(ip, log_port);
        let cmd_socket = find_socket(&fleet.command_plane, cmd_key)
            .ok_or_else(|| RuntimeError::BindFailed { addr: SocketAddr::V4(SocketAddrV4::new(ip, cmd_port)), source: std::io::Error::other("socket not found in fleet") })?;
        let log_socket = find_socket(&fleet.command_plane, log_key).unwrap_or_else(|| Arc::clone(&cmd_socket));

        let host_ports = HostPorts {
            cmd: cmd_port,
            push: push_port,
            point: point_port,
            imu: imu_port,
            log: log_port,
            debug_cloud: crate::ports::DEBUG_CLOUD_PORT,
        };
        let handler: Arc<dyn FamilyHandler> = match tag {
            FamilyTag::A => Arc::new(FamilyA { host_ports }),
            FamilyTag::B => Arc::new(FamilyB { host_ports }),
        };

        let context = Arc::new(FamilyContext {
            handler,
            registry: Arc::clone(&registry),
            correlator: Arc::clone(&correlator),
            seq: Arc::clone(&seq),
            cmd_socket,
            log_socket,
            info_callback: Arc::clone(&info_callback),
            raw_observer: raw_observer.clone(),
            timeout,
        });

        families.insert(*tag, context);
        host_endpoints.insert(*tag, HostEndpoint { host_ip: ip, host_cmd_port: cmd_port });
    }

    Ok((families, host_endpoints))
}

fn find_socket(sockets: &[RegisteredSocket], key: ChannelKey) -> Option<Arc<UdpSocket>> {
    sockets.iter().find(|reg| reg.key == key).map(|reg| Arc::clone(&reg.socket))
}

/// Drives device admission and kicks off the probe/configure sequence for
/// newly admitted devices (spec §4.5, §4.6).
struct DetectionDelegate {
    discovery: Arc<Discovery>,
    registry: Arc<DeviceRegistry>,
    families: HashMap<FamilyTag, Arc<FamilyContext>>,
    host_endpoints: HashMap<FamilyTag, HostEndpoint>,
}

impl ReactorDelegate for DetectionDelegate {
    fn on_packet(&self, _key: ChannelKey, _src: SocketAddr, data: &[u8]) {
        let discovery = Arc::clone(&self.discovery);
        let registry = Arc::clone(&self.registry);
        let families = self.families.clone();
        let host_endpoints = self.host_endpoints.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            let Some((handle, tag, cmd_port)) = discovery.on_reply(&data).await else { return };
            let (Some(family), Some(endpoint)) = (families.get(&tag), host_endpoints.get(&tag)) else {
                warn!(?tag, "admitted device has no configured family context");
                return;
            };
            discovery::probe_and_configure(&registry, family, handle, cmd_port, endpoint.host_ip, endpoint.host_cmd_port).await;
        });
    }
}

/// Dispatches command/push traffic to its family and `PushLog` traffic to
/// the log ingestor (spec §4.7, §4.8, §4.11).
struct CommandPlaneDelegate {
    roles: HashMap<ChannelKey, (FamilyTag, PlaneRole)>,
    families: HashMap<FamilyTag, Arc<FamilyContext>>,
    log_ingestor: Arc<LogIngestor>,
    log_sockets: HashMap<ChannelKey, Arc<UdpSocket>>,
    registry: Arc<DeviceRegistry>,
    eviction_signal: Arc<Notify>,
    correlator: Arc<CommandCorrelator>,
}

impl ReactorDelegate for CommandPlaneDelegate {
    fn on_packet(&self, key: ChannelKey, src: SocketAddr, data: &[u8]) {
        let Some(&(tag, role)) = self.roles.get(&key) else { return };
        let SocketAddr::V4(src_v4) = src else { return };
        let device_ip = *src_v4.ip();
        let src_port = src_v4.port();
        let data = data.to_vec();

        match role {
            PlaneRole::Cmd | PlaneRole::Push => {
                let Some(family) = self.families.get(&tag) else { return };
                let family = Arc::clone(family);
                let is_push_channel = role == PlaneRole::Push;
                tokio::spawn(async move { family.handle(device_ip, src_port, is_push_channel, &data).await });
            }
            PlaneRole::Log => {
                let ingestor = Arc::clone(&self.log_ingestor);
                let registry = Arc::clone(&self.registry);
                let signal = Arc::clone(&self.eviction_signal);
                let socket = self.log_sockets.get(&key).cloned();
                tokio::spawn(async move {
                    handle_push_log(&ingestor, &registry, &signal, socket.as_deref(), device_ip, src_port, &data).await;
                });
            }
            PlaneRole::Point | PlaneRole::Imu => {}
        }
    }

    fn on_tick(&self, _now: Instant) {
        let correlator = Arc::clone(&self.correlator);
        tokio::spawn(async move { correlator.reap_expired(Instant::now()).await });
    }
}

async fn handle_push_log(
    ingestor: &LogIngestor,
    registry: &DeviceRegistry,
    signal: &Notify,
    socket: Option<&UdpSocket>,
    device_ip: Ipv4Addr,
    src_port: u16,
    data: &[u8],
) {
    let packet = match CmdPacket::parse(data) {
        Ok(p) => p,
        Err(err) => {
            warn!(?err, "dropped malformed PushLog packet");
            return;
        }
    };
    if packet.cmd_id != PUSH_LOG || packet.cmd_type != CmdType::Cmd {
        return;
    }
    let Some(header) = PushLogHeader::parse(packet.payload) else {
        warn!("dropped undersized PushLog payload");
        return;
    };

    let handle = DeviceHandle::from_ipv4(device_ip);
    let serial = registry.get(handle).await.map(|r| r.serial_number).unwrap_or_else(|| "UNKNOWN".to_string());
    let was_end = header.is_end();

    let ack = ingestor.handle_push_log(handle, &serial, &header).await;
    if was_end {
        signal.notify_one();
    }

    let (Some(ack), Some(socket)) = (ack, socket) else { return };
    let reply_payload = ack.encode();
    let reply = CmdPacket {
        version: 1,
        seq_num: packet.seq_num,
        cmd_id: PUSH_LOG,
        cmd_type: CmdType::Ack,
        sender_type: SenderType::Host,
        payload: &reply_payload,
    };
    match reply.encode() {
        Ok(encoded) => {
            if let Err(err) = socket.send_to(&encoded, SocketAddrV4::new(device_ip, src_port)).await {
                warn!(?err, "failed to send PushLog ack");
            }
        }
        Err(err) => warn!(?err, "failed to encode PushLog ack"),
    }
}

/// Routes point-cloud/IMU traffic through the [`DataRouter`] and, when a
/// debug capture is active for the sending device, mirrors the raw
/// datagram to disk (spec §4.9, §4.13).
struct DataPlaneDelegate {
    roles: HashMap<ChannelKey, (FamilyTag, PlaneRole)>,
    debug_cloud_key: ChannelKey,
    router: Arc<DataRouter>,
    debug_sinks: Arc<StdMutex<HashMap<DeviceHandle, DebugCloudSink>>>,
}

impl ReactorDelegate for DataPlaneDelegate {
    fn on_packet(&self, key: ChannelKey, src: SocketAddr, data: &[u8]) {
        let SocketAddr::V4(src_v4) = src else { return };
        let handle = DeviceHandle::from_ipv4(*src_v4.ip());

        if key == self.debug_cloud_key {
            let sinks = self.debug_sinks.lock().unwrap();
            if let Some(sink) = sinks.get(&handle) {
                sink.capture(CaptureChunk { handle, data: data.to_vec() });
            }
            return;
        }

        let Some(&(tag, role)) = self.roles.get(&key) else { return };
        let channel = match role {
            PlaneRole::Point => Channel::PointCloud,
            PlaneRole::Imu => Channel::Imu,
            _ => return,
        };
        self.router.route(channel, handle, tag, data);
    }
}
