//! JSON configuration schema and loader (spec §6).
//!
//! Parsing JSON is out of core scope per spec §1; the *schema* its output
//! must conform to is in scope, since the socket fleet and per-family
//! handlers are built directly from it. This loader is the thin,
//! replaceable boundary between the two.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ports::FamilyTag;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LidarNetInfo {
    pub cmd_data_port: u16,
    pub push_msg_port: u16,
    pub point_data_port: u16,
    pub imu_data_port: u16,
    pub log_data_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostNetInfoSingle {
    #[serde(alias = "cmd_data_ip")]
    pub host_ip: String,
    pub multicast_ip: Option<String>,
    pub cmd_data_port: u16,
    pub push_msg_port: u16,
    pub point_data_port: u16,
    pub imu_data_port: u16,
    pub log_data_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostNetInfoEntry {
    #[serde(alias = "cmd_data_ip")]
    pub host_ip: String,
    pub multicast_ip: Option<String>,
    pub cmd_data_port: u16,
    pub push_msg_port: u16,
    pub point_data_port: u16,
    pub imu_data_port: u16,
    pub log_data_port: u16,
    pub lidar_ip: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HostNetInfo {
    Single(HostNetInfoSingle),
    PerHost(Vec<HostNetInfoEntry>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FamilyConfig {
    pub lidar_net_info: LidarNetInfo,
    pub host_net_info: HostNetInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LoggerConfig {
    #[serde(default)]
    pub lidar_log_enable: bool,
    #[serde(default, rename = "lidar_log_cache_size_MB")]
    pub lidar_log_cache_size_mb: u64,
    #[serde(default = "default_log_path")]
    pub lidar_log_path: String,
}

fn default_log_path() -> String {
    "./".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub master_sdk: bool,
    #[serde(flatten)]
    pub logger: LoggerConfig,
    #[serde(flatten)]
    pub families: FamilyMap,
}

/// Thin wrapper so the top-level JSON object can mix scalar keys
/// (`master_sdk`, `lidar_log_*`) with family-tag keys (`HAP`, `MID360`)
/// at the same nesting level, as spec §6 describes.
#[derive(Debug, Clone, Default)]
pub struct FamilyMap(pub HashMap<FamilyTag, FamilyConfig>);

impl Serialize for FamilyMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FamilyMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Deserialize the whole object as a generic map first, then pick out
        // the keys that name a known family tag; unknown keys (master_sdk,
        // lidar_log_*) are simply not family tags and are ignored here.
        let raw: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
        let mut families = HashMap::new();
        for (key, value) in raw {
            let tag = match key.as_str() {
                "HAP" => FamilyTag::A,
                "MID360" => FamilyTag::B,
                _ => continue,
            };
            let cfg: FamilyConfig = serde_json::from_value(value).map_err(serde::de::Error::custom)?;
            families.insert(tag, cfg);
        }
        Ok(FamilyMap(families))
    }
}

impl SdkConfig {
    /// Loads and validates a config file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses and validates a config document already in memory.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: SdkConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.logger.lidar_log_enable {
            if self.logger.lidar_log_cache_size_mb == 0
                || self.logger.lidar_log_cache_size_mb > 1_000_000
            {
                return Err(ConfigError::Invalid(
                    "lidar_log_cache_size_MB must be in (0, 1_000_000]".into(),
                ));
            }
        }

        for (tag, family) in &self.families.0 {
            match &family.host_net_info {
                HostNetInfo::Single(info) => {
                    validate_host_ip(&info.host_ip, *tag)?;
                }
                HostNetInfo::PerHost(entries) => {
                    for entry in entries {
                        validate_host_ip(&entry.host_ip, *tag)?;
                        if entry.lidar_ip.is_empty() {
                            return Err(ConfigError::Invalid(format!(
                                "family {tag:?}: host entry for {} lists no lidar_ip",
                                entry.host_ip
                            )));
                        }
                        for ip in &entry.lidar_ip {
                            ip.parse::<Ipv4Addr>().map_err(|_| {
                                ConfigError::Invalid(format!("invalid lidar_ip {ip}"))
                            })?;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_host_ip(host_ip: &str, tag: FamilyTag) -> Result<(), ConfigError> {
    if host_ip == "local" || host_ip == "0.0.0.0" {
        return Ok(());
    }
    host_ip
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ConfigError::Invalid(format!("family {tag:?}: invalid host_ip {host_ip}")))
}

/// Computed log cache budgets in bytes, per spec §4.11's formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCacheBudgets {
    pub realtime_bytes: u64,
    pub exception_bytes: u64,
}

const MAX_EXCEPTION_LOG_CACHE_MB: u64 = 200;
const EXCEPTION_RATIO: u64 = 1;
const REALTIME_RATIO: u64 = 3;

#[must_use]
pub fn compute_log_cache_budgets(total_mb: u64) -> LogCacheBudgets {
    let mb = 1024 * 1024;
    if total_mb > MAX_EXCEPTION_LOG_CACHE_MB * (EXCEPTION_RATIO + REALTIME_RATIO) / EXCEPTION_RATIO
    {
        LogCacheBudgets {
            exception_bytes: MAX_EXCEPTION_LOG_CACHE_MB * mb,
            realtime_bytes: (total_mb - MAX_EXCEPTION_LOG_CACHE_MB) * mb,
        }
    } else {
        LogCacheBudgets {
            realtime_bytes: total_mb * REALTIME_RATIO / (EXCEPTION_RATIO + REALTIME_RATIO) * mb,
            exception_bytes: total_mb * EXCEPTION_RATIO / (EXCEPTION_RATIO + REALTIME_RATIO) * mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_host_family() {
        let json = r#"{
            "master_sdk": true,
            "lidar_log_enable": true,
            "lidar_log_cache_size_MB": 1000,
            "lidar_log_path": "/var/log/lidar",
            "MID360": {
                "lidar_net_info": {
                    "cmd_data_port": 56100, "push_msg_port": 56200,
                    "point_data_port": 56300, "imu_data_port": 56400,
                    "log_data_port": 56500
                },
                "host_net_info": {
                    "host_ip": "192.168.1.50",
                    "cmd_data_port": 56101, "push_msg_port": 56201,
                    "point_data_port": 56301, "imu_data_port": 56401,
                    "log_data_port": 56501
                }
            }
        }"#;
        let cfg = SdkConfig::parse(json).unwrap();
        assert!(cfg.master_sdk);
        assert!(cfg.families.0.contains_key(&FamilyTag::B));
    }

    #[test]
    fn parses_per_host_family_with_device_list() {
        let json = r#"{
            "HAP": {
                "lidar_net_info": {
                    "cmd_data_port": 56000, "push_msg_port": 56000,
                    "point_data_port": 57000, "imu_data_port": 58000,
                    "log_data_port": 59000
                },
                "host_net_info": [
                    {
                        "host_ip": "192.168.1.50",
                        "cmd_data_port": 56000, "push_msg_port": 56000,
                        "point_data_port": 57000, "imu_data_port": 58000,
                        "log_data_port": 59000,
                        "lidar_ip": ["192.168.1.101", "192.168.1.102"]
                    }
                ]
            }
        }"#;
        let cfg = SdkConfig::parse(json).unwrap();
        let family = &cfg.families.0[&FamilyTag::A];
        match &family.host_net_info {
            HostNetInfo::PerHost(entries) => assert_eq!(entries[0].lidar_ip.len(), 2),
            HostNetInfo::Single(_) => panic!("expected per-host variant"),
        }
    }

    #[test]
    fn rejects_log_cache_size_over_1_000_000_mb() {
        let json = r#"{"lidar_log_enable": true, "lidar_log_cache_size_MB": 2000000}"#;
        assert!(SdkConfig::parse(json).is_err());
    }

    #[test]
    fn cache_budget_splits_3_to_1_below_cap() {
        let budgets = compute_log_cache_budgets(1);
        assert_eq!(budgets.realtime_bytes, 768 * 1024);
        assert_eq!(budgets.exception_bytes, 256 * 1024);
    }

    #[test]
    fn cache_budget_caps_exception_at_200mb_above_threshold() {
        let budgets = compute_log_cache_budgets(10_000);
        assert_eq!(budgets.exception_bytes, 200 * 1024 * 1024);
        assert_eq!(budgets.realtime_bytes, 9_800 * 1024 * 1024);
    }
}
