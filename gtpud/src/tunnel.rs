//! GTP tunnel records.
//!
//! A tunnel is pure configuration: it relates one local endpoint, one
//! remote endpoint address, one TUN device and the pair of TEIDs, and
//! holds a registry reference on the endpoint and the device. It keeps
//! no per-packet state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;

use crate::endpoint::{EndpointError, GtpEndpoint};
use crate::tun::{TunDevice, TunError};

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Another tunnel already owns (local endpoint, rx TEID) or
    /// (TUN device, user address).
    #[error("Tunnel key already in use")]
    Duplicate,

    #[error("No such tunnel")]
    NotFound,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Tun(#[from] TunError),
}

/// Everything `create_tun` needs to install a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub rx_teid: u32,
    pub tx_teid: u32,
    pub user_addr: IpAddr,
    pub tun_name: String,
    pub tun_netns: Option<String>,
}

pub struct GtpTunnel {
    pub local_ep: Arc<GtpEndpoint>,
    pub remote: SocketAddr,
    pub tun: Arc<TunDevice>,
    pub rx_teid: u32,
    pub tx_teid: u32,
    pub user_addr: IpAddr,
}

impl fmt::Display for GtpTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/rx=0x{:08x}/tx=0x{:08x}",
            self.local_ep.name, self.rx_teid, self.tx_teid
        )
    }
}
