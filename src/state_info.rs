//! Push-state TLV parsing into a stable, partially-populated JSON record
//! (spec §4.10).
//!
//! The numeric key assignments below are this runtime's own convention —
//! the upstream key table lives in a header that was filtered out of the
//! retrieved material, the same situation documented on
//! [`crate::command_ids::KEY_FW_TYPE`]. Only internal consistency between
//! the parser here and the encoder in `lidar-sim` is required.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::tlv::Param;

macro_rules! state_keys {
    ($($name:ident = $val:expr),* $(,)?) => {
        $(pub const $name: u16 = $val;)*
    };
}

state_keys! {
    KEY_PCL_DATA_TYPE = 0x0010,
    KEY_PATTERN_MODE = 0x0011,
    KEY_DUAL_EMIT_EN = 0x0012,
    KEY_POINT_SEND_EN = 0x0013,
    KEY_LIDAR_IPCFG = 0x0014,
    KEY_STATE_INFO_HOST_IPCFG = 0x0015,
    KEY_POINTCLOUD_HOST_IPCFG = 0x0016,
    KEY_IMU_HOST_IPCFG = 0x0017,
    KEY_CTL_HOST_IPCFG = 0x0018,
    KEY_LOG_HOST_IPCFG = 0x0019,
    KEY_VEHICLE_SPEED = 0x001A,
    KEY_ENVIRONMENT_TEMP = 0x001B,
    KEY_INSTALL_ATTITUDE = 0x001C,
    KEY_BLIND_SPOT_SET = 0x001D,
    KEY_FRAME_RATE = 0x001E,
    KEY_FOV_CFG_0 = 0x001F,
    KEY_FOV_CFG_1 = 0x0020,
    KEY_FOV_CFG_EN = 0x0021,
    KEY_DETECT_MODE = 0x0022,
    KEY_FUNC_IO_CFG = 0x0023,
    KEY_WORK_TGT_MODE = 0x0024,
    KEY_GLASS_HEAT = 0x0025,
    KEY_IMU_DATA_EN = 0x0026,
    KEY_FUSA_EN = 0x0027,
    KEY_SN = 0x0028,
    KEY_PRODUCT_INFO = 0x0029,
    KEY_VERSION_APP = 0x002A,
    KEY_VERSION_LOADER = 0x002B,
    KEY_VERSION_HARDWARE = 0x002C,
    KEY_MAC = 0x002D,
    KEY_CUR_WORK_STATE = 0x002E,
    KEY_CORE_TEMP = 0x002F,
    KEY_POWERUP_CNT = 0x0030,
    KEY_LOCAL_TIME_NOW = 0x0031,
    KEY_LAST_SYNC_TIME = 0x0032,
    KEY_TIME_OFFSET = 0x0033,
    KEY_TIME_SYNC_TYPE = 0x0034,
    KEY_STATUS_CODE = 0x0035,
    KEY_LIDAR_DIAG_STATUS = 0x0036,
    KEY_LIDAR_FLASH_STATUS = 0x0037,
    KEY_FW_TYPE = 0x0038,
    KEY_HMS_CODE = 0x0039,
    KEY_ROI_MODE = 0x003A,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IpCfg {
    pub ip: String,
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostIpCfg {
    pub ip: String,
    pub dst_port: u16,
    pub src_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InstallAttitude {
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub x_mm: f32,
    pub y_mm: f32,
    pub z_mm: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FovCfg {
    pub yaw_start: f32,
    pub yaw_stop: f32,
    pub pitch_start: f32,
    pub pitch_stop: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FuncIoCfg {
    #[serde(rename = "IN0")]
    pub in0: u8,
    #[serde(rename = "IN1")]
    pub in1: u8,
    #[serde(rename = "OUT0")]
    pub out0: u8,
    #[serde(rename = "OUT1")]
    pub out1: u8,
}

/// Decodes a 4-byte big-endian-dotted IP field into dotted-decimal form.
fn decode_ip_be(bytes: &[u8]) -> Option<String> {
    let [a, b, c, d] = <[u8; 4]>::try_from(bytes).ok()?;
    Some(Ipv4Addr::new(a, b, c, d).to_string())
}

fn decode_ipcfg(value: &[u8]) -> Option<IpCfg> {
    if value.len() < 12 {
        return None;
    }
    Some(IpCfg {
        ip: decode_ip_be(&value[0..4])?,
        subnet: decode_ip_be(&value[4..8])?,
        gateway: decode_ip_be(&value[8..12])?,
    })
}

fn decode_host_ipcfg(value: &[u8]) -> Option<HostIpCfg> {
    if value.len() < 8 {
        return None;
    }
    Some(HostIpCfg {
        ip: decode_ip_be(&value[0..4])?,
        dst_port: u16::from_be_bytes([value[4], value[5]]),
        src_port: u16::from_be_bytes([value[6], value[7]]),
    })
}

fn decode_f32_array(value: &[u8]) -> Option<Vec<f32>> {
    if value.len() % 4 != 0 {
        return None;
    }
    Some(
        value
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn decode_u8(value: &[u8]) -> Option<u8> {
    value.first().copied()
}

fn decode_bool(value: &[u8]) -> Option<bool> {
    decode_u8(value).map(|b| b != 0)
}

fn decode_u16(value: &[u8]) -> Option<u16> {
    <[u8; 2]>::try_from(value).ok().map(u16::from_le_bytes)
}

fn decode_u32(value: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(value).ok().map(u32::from_le_bytes)
}

fn decode_u64(value: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(value).ok().map(u64::from_le_bytes)
}

fn decode_i32(value: &[u8]) -> Option<i32> {
    <[u8; 4]>::try_from(value).ok().map(i32::from_le_bytes)
}

fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim_end_matches('\0').to_string()
}

fn decode_version_quad(value: &[u8]) -> Option<[u8; 4]> {
    <[u8; 4]>::try_from(value).ok()
}

fn decode_mac(value: &[u8]) -> Option<[u8; 6]> {
    <[u8; 6]>::try_from(value).ok()
}

fn decode_hms_code(value: &[u8]) -> Option<Vec<u32>> {
    if value.len() % 4 != 0 {
        return None;
    }
    Some(value.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

/// Structured, partially-populated render of a device's push-state message.
/// Only keys present in the input are serialized (spec §4.10).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStateInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcl_data_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dual_emit_en: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_send_en: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lidar_ipcfg: Option<IpCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_info_host_ipcfg: Option<HostIpCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointcloud_host_ipcfg: Option<HostIpCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imu_host_ipcfg: Option<HostIpCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctl_host_ipcfg: Option<HostIpCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_host_ipcfg: Option<HostIpCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_attitude: Option<InstallAttitude>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blind_spot_set: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f32>,
    #[serde(rename = "fov_cfg_0", skip_serializing_if = "Option::is_none")]
    pub fov_cfg_0: Option<FovCfg>,
    #[serde(rename = "fov_cfg_1", skip_serializing_if = "Option::is_none")]
    pub fov_cfg_1: Option<FovCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fov_cfg_en: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func_io_cfg: Option<FuncIoCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_tgt_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glass_heat: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imu_data_en: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusa_en: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_app: Option<[u8; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_loader: Option<[u8; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_hardware: Option<[u8; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<[u8; 6]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur_work_state: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_temp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powerup_cnt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_time_now: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_sync_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lidar_diag_status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lidar_flash_status: Option<u32>,
    #[serde(rename = "FW_TYPE", skip_serializing_if = "Option::is_none")]
    pub fw_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hms_code: Option<Vec<u32>>,
    #[serde(rename = "ROI_Mode", skip_serializing_if = "Option::is_none")]
    pub roi_mode: Option<u8>,
}

impl DeviceStateInfo {
    /// Parses a push-state TLV stream permissively: unknown keys are
    /// skipped, malformed known-key values are skipped rather than failing
    /// the whole record (spec §4.10: "skip unknown keys by declared
    /// length").
    #[must_use]
    pub fn from_tlv(params: &[Param<'_>]) -> Self {
        let mut info = Self::default();
        for p in params {
            match p.key {
                KEY_PCL_DATA_TYPE => info.pcl_data_type = decode_u8(p.value),
                KEY_PATTERN_MODE => info.pattern_mode = decode_u8(p.value),
                KEY_DUAL_EMIT_EN => info.dual_emit_en = decode_bool(p.value),
                KEY_POINT_SEND_EN => info.point_send_en = decode_bool(p.value),
                KEY_LIDAR_IPCFG => info.lidar_ipcfg = decode_ipcfg(p.value),
                KEY_STATE_INFO_HOST_IPCFG => info.state_info_host_ipcfg = decode_host_ipcfg(p.value),
                KEY_POINTCLOUD_HOST_IPCFG => info.pointcloud_host_ipcfg = decode_host_ipcfg(p.value),
                KEY_IMU_HOST_IPCFG => info.imu_host_ipcfg = decode_host_ipcfg(p.value),
                KEY_CTL_HOST_IPCFG => info.ctl_host_ipcfg = decode_host_ipcfg(p.value),
                KEY_LOG_HOST_IPCFG => info.log_host_ipcfg = decode_host_ipcfg(p.value),
                KEY_VEHICLE_SPEED => info.vehicle_speed = decode_f32_array(p.value).and_then(|v| v.first().copied()),
                KEY_ENVIRONMENT_TEMP => {
                    info.environment_temp = decode_f32_array(p.value).and_then(|v| v.first().copied());
                }
                KEY_INSTALL_ATTITUDE => {
                    info.install_attitude = decode_f32_array(p.value).and_then(|v| {
                        if v.len() == 6 {
                            Some(InstallAttitude {
                                roll_deg: v[0],
                                pitch_deg: v[1],
                                yaw_deg: v[2],
                                x_mm: v[3],
                                y_mm: v[4],
                                z_mm: v[5],
                            })
                        } else {
                            None
                        }
                    });
                }
                KEY_BLIND_SPOT_SET => info.blind_spot_set = decode_u32(p.value),
                KEY_FRAME_RATE => info.frame_rate = decode_f32_array(p.value).and_then(|v| v.first().copied()),
                KEY_FOV_CFG_0 => info.fov_cfg_0 = decode_fov(p.value),
                KEY_FOV_CFG_1 => info.fov_cfg_1 = decode_fov(p.value),
                KEY_FOV_CFG_EN => info.fov_cfg_en = decode_bool(p.value),
                KEY_DETECT_MODE => info.detect_mode = decode_u8(p.value),
                KEY_FUNC_IO_CFG => {
                    info.func_io_cfg = if p.value.len() >= 4 {
                        Some(FuncIoCfg {
                            in0: p.value[0],
                            in1: p.value[1],
                            out0: p.value[2],
                            out1: p.value[3],
                        })
                    } else {
                        None
                    };
                }
                KEY_WORK_TGT_MODE => info.work_tgt_mode = decode_u8(p.value),
                KEY_GLASS_HEAT => info.glass_heat = decode_u8(p.value),
                KEY_IMU_DATA_EN => info.imu_data_en = decode_bool(p.value),
                KEY_FUSA_EN => info.fusa_en = decode_bool(p.value),
                KEY_SN => info.sn = Some(decode_string(p.value)),
                KEY_PRODUCT_INFO => info.product_info = Some(decode_string(p.value)),
                KEY_VERSION_APP => info.version_app = decode_version_quad(p.value),
                KEY_VERSION_LOADER => info.version_loader = decode_version_quad(p.value),
                KEY_VERSION_HARDWARE => info.version_hardware = decode_version_quad(p.value),
                KEY_MAC => info.mac = decode_mac(p.value),
                KEY_CUR_WORK_STATE => info.cur_work_state = decode_u8(p.value),
                KEY_CORE_TEMP => info.core_temp = decode_i32(p.value),
                KEY_POWERUP_CNT => info.powerup_cnt = decode_u32(p.value),
                KEY_LOCAL_TIME_NOW => info.local_time_now = decode_u64(p.value),
                KEY_LAST_SYNC_TIME => info.last_sync_time = decode_u64(p.value),
                KEY_TIME_OFFSET => info.time_offset = decode_i32(p.value),
                KEY_TIME_SYNC_TYPE => info.time_sync_type = decode_u8(p.value),
                KEY_STATUS_CODE => info.status_code = decode_u32(p.value),
                KEY_LIDAR_DIAG_STATUS => info.lidar_diag_status = decode_u32(p.value),
                KEY_LIDAR_FLASH_STATUS => info.lidar_flash_status = decode_u32(p.value),
                KEY_FW_TYPE => info.fw_type = decode_u8(p.value),
                KEY_HMS_CODE => info.hms_code = decode_hms_code(p.value),
                KEY_ROI_MODE => info.roi_mode = decode_u8(p.value),
                _ => {} // unknown key: skip, per spec §4.10
            }
        }
        info
    }

    /// Renders this record as the stable JSON string handed to the user
    /// "info" callback.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn decode_fov(value: &[u8]) -> Option<FovCfg> {
    decode_f32_array(value).and_then(|v| {
        if v.len() == 4 {
            Some(FovCfg {
                yaw_start: v[0],
                yaw_stop: v[1],
                pitch_start: v[2],
                pitch_stop: v[3],
            })
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv;

    #[test]
    fn only_present_keys_are_serialized() {
        let params = vec![Param { key: KEY_SN, value: b"LD0001\0\0" }];
        let info = DeviceStateInfo::from_tlv(&params);
        let json = info.to_json().unwrap();
        assert!(json.contains("\"sn\":\"LD0001\""));
        assert!(!json.contains("pattern_mode"));
    }

    #[test]
    fn unknown_keys_are_skipped_without_error() {
        let bytes = tlv::pack(&[Param { key: 0xBEEF, value: &[1, 2, 3] }]);
        let params = tlv::parse(&bytes).unwrap();
        let info = DeviceStateInfo::from_tlv(&params);
        assert_eq!(info, DeviceStateInfo::default());
    }

    #[test]
    fn decodes_ip_cfg_group() {
        let mut value = Vec::new();
        value.extend_from_slice(&[192, 168, 1, 100]);
        value.extend_from_slice(&[255, 255, 255, 0]);
        value.extend_from_slice(&[192, 168, 1, 1]);
        let params = vec![Param { key: KEY_LIDAR_IPCFG, value: &value }];
        let info = DeviceStateInfo::from_tlv(&params);
        let cfg = info.lidar_ipcfg.unwrap();
        assert_eq!(cfg.ip, "192.168.1.100");
        assert_eq!(cfg.gateway, "192.168.1.1");
    }

    #[test]
    fn decodes_bool_and_version_quad() {
        let params = vec![
            Param { key: KEY_DUAL_EMIT_EN, value: &[1] },
            Param { key: KEY_VERSION_APP, value: &[1, 2, 3, 4] },
        ];
        let info = DeviceStateInfo::from_tlv(&params);
        assert_eq!(info.dual_emit_en, Some(true));
        assert_eq!(info.version_app, Some([1, 2, 3, 4]));
    }
}
