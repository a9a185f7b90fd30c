// Server configuration.
//
// `ServerConfig` is plain data with serde defaults, so a JSON config file
// only needs the keys it wants to override. The binary layers CLI flags on
// top of the file (see `main.rs`); embedders construct it directly.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use netplay_protocol::{NUM_PLAYERS, PlayerNumber};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// 0 lets the OS pick; UDP then binds the same number.
    pub port: u16,
    /// Client input-queue depth the adaptive buffer aims for.
    pub buffer_target: u8,
    /// Send-ahead depth every player starts with.
    pub initial_buffer_size: u32,
    /// Per-port input delay in frames. `None` delivers inputs immediately.
    pub input_delay: [Option<u32>; NUM_PLAYERS],
    /// Ticks without a `REQUEST_DATA` before a registration is dropped.
    pub keepalive_threshold: u32,
    pub tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            buffer_target: 2,
            initial_buffer_size: 3,
            input_delay: [None; NUM_PLAYERS],
            keepalive_threshold: 40,
            tick_interval_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ServerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ServerError> {
        let json = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn set_input_delay(&mut self, player: PlayerNumber, frames: Option<u32>) {
        self.input_delay[player.index()] = frames;
    }
}
