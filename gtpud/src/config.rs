//! Daemon configuration file (TOML).

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot open config file {0}: {1}")]
    Open(PathBuf, io::Error),

    #[error("Cannot parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cups: CupsConfig,
}

/// Where the UECUPS control socket listens.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CupsConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
}

impl Default for CupsConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: gtpud_proto::UECUPS_DEFAULT_PORT,
        }
    }
}

impl CupsConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Open(path.to_path_buf(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}
