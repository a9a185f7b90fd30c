use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use netplay_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {transport} socket on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("server is already bound")]
    AlreadyBound,
    #[error("server has been stopped")]
    Stopped,
    #[error("session closed while waiting")]
    SessionClosed,
    #[error("failed to read config {path}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },
    #[error("invalid config: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
