//! Error types for the connector's fallible entry points.
//!
//! Per-client I/O failures are not modeled here — those are handled inline by
//! invalidating the client (see `registry`) and never surface past the event
//! loop. This enum covers only the things that can fail a whole process:
//! configuration, listener binding, and control-socket setup.

use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("failed to read config file '{0}': {1}")]
    ConfigRead(PathBuf, std::io::Error),

    #[error("failed to parse config file '{0}': {1}")]
    ConfigParse(PathBuf, toml::de::Error),

    #[error("invalid listen address '{0}': {1}")]
    InvalidAddress(String, std::net::AddrParseError),

    #[error("failed to bind {0} after exhausting retry budget: {1}")]
    BindExhausted(SocketAddr, std::io::Error),

    #[error("failed to create readiness subsystem: {0}")]
    PollCreate(std::io::Error),

    #[error("failed to set up control socket at '{0}': {1}")]
    ControlSocket(PathBuf, std::io::Error),

    #[error("failed to connect peer-process socket '{0}': {1}")]
    PeerSocket(PathBuf, std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
