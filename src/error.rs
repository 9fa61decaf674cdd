use std::net::SocketAddr;

use thiserror::Error;

/// Conditions that stop the relay before any worker thread starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("hardware context already initialised in this process")]
    HardwareBusy,
    #[error("open {path}")]
    SerialOpen {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
