//! Device registry: one record per sensor handle (spec §3, §4.6).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::sync::Mutex;
use tracing::warn;

use crate::handle::DeviceHandle;
use crate::ports::FamilyTag;

/// Lifecycle stage of a device record (spec §3 "Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStage {
    Probing,
    Configuring,
    Ready,
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub handle: DeviceHandle,
    pub serial_number: String,
    pub device_type: FamilyTag,
    pub lidar_ip: String,
    pub cmd_port: u16,

    pub stage: DeviceStage,
    pub loader_mode_known: bool,
    pub is_loader_mode: bool,
    pub config_applied: bool,
    pub change_notified: bool,
    pub probe_attempts: u8,

    // View-mode discovered channel ports; populated once known.
    pub host_point_port: Option<u16>,
    pub host_imu_port: Option<u16>,
    pub lidar_point_port: Option<u16>,
    pub lidar_imu_port: Option<u16>,
    pub host_ip: Option<Ipv4Addr>,
}

impl DeviceRecord {
    #[must_use]
    pub fn new(handle: DeviceHandle, serial_number: String, device_type: FamilyTag, cmd_port: u16) -> Self {
        Self {
            handle,
            serial_number,
            device_type,
            lidar_ip: handle.to_ipv4().to_string(),
            cmd_port,
            stage: DeviceStage::Probing,
            loader_mode_known: false,
            is_loader_mode: false,
            config_applied: false,
            change_notified: false,
            probe_attempts: 0,
            host_point_port: None,
            host_imu_port: None,
            lidar_point_port: None,
            lidar_imu_port: None,
            host_ip: None,
        }
    }
}

/// Maximum probe retries before a device is assumed non-loader (spec §4.6).
pub const MAX_PROBE_ATTEMPTS: u8 = 10;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceHandle, DeviceRecord>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a newly detected device. Returns `true` if this is a new
    /// handle. A repeat detection of a known handle with a conflicting
    /// serial or device type is logged and otherwise ignored: the first
    /// record seen is kept (spec §3).
    pub async fn admit(
        &self,
        handle: DeviceHandle,
        serial_number: String,
        device_type: FamilyTag,
        cmd_port: u16,
    ) -> bool {
        let mut devices = self.devices.lock().await;
        if let Some(existing) = devices.get(&handle) {
            if existing.serial_number != serial_number {
                warn!(
                    handle = %handle,
                    existing = %existing.serial_number,
                    incoming = %serial_number,
                    "conflicting serial number for known device handle, keeping first seen",
                );
            }
            if existing.device_type != device_type {
                warn!(handle = %handle, "conflicting device type for known device handle, keeping first seen");
            }
            return false;
        }
        devices.insert(handle, DeviceRecord::new(handle, serial_number, device_type, cmd_port));
        true
    }

    pub async fn get(&self, handle: DeviceHandle) -> Option<DeviceRecord> {
        self.devices.lock().await.get(&handle).cloned()
    }

    pub async fn contains(&self, handle: DeviceHandle) -> bool {
        self.devices.lock().await.contains_key(&handle)
    }

    /// Applies `f` to the record for `handle` under the registry lock,
    /// returning `None` if the handle is unknown.
    pub async fn update<F, R>(&self, handle: DeviceHandle, f: F) -> Option<R>
    where
        F: FnOnce(&mut DeviceRecord) -> R,
    {
        let mut devices = self.devices.lock().await;
        devices.get_mut(&handle).map(f)
    }

    /// Records a failed probe attempt; returns `true` once the cap is
    /// reached (spec §4.6: after ten tries, treat as non-loader).
    pub async fn record_probe_failure(&self, handle: DeviceHandle) -> bool {
        self.update(handle, |record| {
            record.probe_attempts += 1;
            record.probe_attempts >= MAX_PROBE_ATTEMPTS
        })
        .await
        .unwrap_or(false)
    }

    pub async fn resolve_probe(&self, handle: DeviceHandle, is_loader_mode: bool) {
        self.update(handle, |record| {
            record.loader_mode_known = true;
            record.is_loader_mode = is_loader_mode;
            record.stage = if is_loader_mode {
                DeviceStage::Probing
            } else {
                DeviceStage::Configuring
            };
        })
        .await;
    }

    /// Marks the device ready and returns `true` exactly once: the first
    /// caller to transition a device into `Ready` gets `true` and is
    /// responsible for firing the info-change callback (spec §4.6, §5).
    pub async fn mark_ready_once(&self, handle: DeviceHandle) -> bool {
        self.update(handle, |record| {
            record.config_applied = true;
            record.stage = DeviceStage::Ready;
            if record.change_notified {
                false
            } else {
                record.change_notified = true;
                true
            }
        })
        .await
        .unwrap_or(false)
    }

    pub async fn all_handles(&self) -> Vec<DeviceHandle> {
        self.devices.lock().await.keys().copied().collect()
    }
}
