//! Error types for every layer of the runtime, grouped roughly by the
//! boundary at which they are produced (see spec §7).

use thiserror::Error;

/// Errors produced while encoding or decoding a framed [`crate::framing::CmdPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("buffer too short for a header")]
    Truncated,
    #[error("bad start-of-frame byte")]
    BadSof,
    #[error("declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("CRC-16 header check failed")]
    BadCrc16,
    #[error("CRC-32 payload check failed")]
    BadCrc32,
    #[error("unrecognized cmd_type or sender_type byte")]
    BadTypeTag,
    #[error("payload of {0} bytes exceeds the 1400 byte maximum")]
    PayloadTooLarge(usize),
}

/// Errors produced while packing or parsing a TLV parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlvError {
    #[error("declared value length exceeds remaining bytes")]
    ShortRead,
    #[error("TLV header truncated")]
    Truncated,
}

/// Errors surfaced to a command caller (spec §7 transport-level kinds).
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("handle {0:?} is not a known device")]
    InvalidHandle(crate::handle::DeviceHandle),
    #[error("no outbound channel is available for this command")]
    ChannelMissing,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("command timed out waiting for an ack")]
    Timeout,
    #[error("command correlator is shutting down")]
    Cancelled,
}

/// Errors produced while loading and validating the JSON configuration (§6).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error returned by runtime initialization and shutdown.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind socket {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create directory {path}: {source}")]
    DirCreateFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}
