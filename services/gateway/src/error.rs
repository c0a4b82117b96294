//! Typed error taxonomy for the gateway, one enum per component boundary.
//!
//! Each error kind maps to the handling described in the core design doc's
//! error-handling section: transport errors close the connection, codec
//! errors resync without closing, state violations are logged and the
//! offending frame dropped.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("register frame received before an ICCID was reported")]
    RegisterBeforeIccid,
    #[error("identity reassignment attempted: connection already bound to {existing}, got {attempted}")]
    IdentityReassignment { existing: String, attempted: String },
    #[error("register payload too short: got {0} bytes, need at least 1")]
    PayloadTooShort(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("payload too short for this opcode: got {got} bytes, need at least {need}")]
    PayloadTooShort { got: usize, need: usize },
    #[error("handshake violation: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("no pending command matches (physical_id={physical_id:08X}, message_id={message_id}, command={command:#04x})")]
    UnknownPendingCommand {
        physical_id: u32,
        message_id: u16,
        command: u8,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("duplicate pending-command key, dropping new insert")]
    DuplicateKey,
    #[error("write to device failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("no active connection for device {0}")]
    DeviceNotConnected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config as TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unrecognized configuration key: {0}")]
    UnknownKey(String),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("read from {addr} failed: {source}")]
    Read {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("write to {addr} failed: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
