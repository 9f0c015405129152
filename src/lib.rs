//! # lidar-runtime
//!
//! Host-side control and telemetry runtime for networked LiDAR sensors:
//! device discovery, a framed dual-CRC command protocol, log ingestion with
//! cache eviction, and a firmware upgrade driver.
//!
//! ## Quick start
//!
//! ```no_run
//! use lidar_runtime::config::SdkConfig;
//! use lidar_runtime::runtime::{Runtime, RuntimeOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SdkConfig::load(std::path::Path::new("config.json"))?;
//! let runtime = Runtime::init(config, RuntimeOptions::default()).await?;
//! // ... drive the runtime, install callbacks on `runtime.router` ...
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`framing`] / [`tlv`] — wire codec: the 24-byte dual-CRC header and the
//!   TLV parameter list carried by most commands
//! - [`seq`] / [`correlator`] — outbound sequence numbers and the in-flight
//!   ack/timeout table built on top of them
//! - [`socket_fleet`] / [`reactor`] — binds every host-side socket and
//!   drives three independent read loops over them
//! - [`discovery`] / [`registry`] — the detection broadcast, device
//!   admission, and the probe → configure lifecycle
//! - [`family`] — the two concrete device families sharing one command
//!   contract
//! - [`router`] / [`state_info`] — demultiplexing point-cloud/IMU traffic
//!   and decoding push-state TLVs into JSON
//! - [`logger`] / [`upgrade`] / [`debug_cloud`] — the three higher-level
//!   subsystems built on top of the command layer
//! - [`runtime`] — wires all of the above into one running process

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod command_ids;
pub mod config;
pub mod correlator;
pub mod debug_cloud;
pub mod discovery;
pub mod error;
pub mod family;
pub mod framing;
pub mod handle;
pub mod logger;
pub mod ports;
pub mod reactor;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod seq;
pub mod socket_fleet;
pub mod state_info;
pub mod tlv;
pub mod upgrade;

pub use error::RuntimeError;
pub use handle::DeviceHandle;
pub use runtime::{Runtime, RuntimeOptions};
