//! Test utilities: a TUN stand-in backed by a socketpair.
//!
//! A datagram socketpair preserves packet boundaries just like the TUN
//! character device, so the forwarding paths can be exercised without
//! CAP_NET_ADMIN. The device end is installed into a daemon's registry
//! under a chosen name; `create_tun` then finds it instead of opening
//! /dev/net/tun.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsFd;
use std::sync::Arc;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::daemon::Daemon;
use crate::tun::TunError;

/// The far end of a fake TUN device: what the kernel would see.
pub struct TunPeer {
    file: File,
}

impl TunPeer {
    /// Inject a packet as if the kernel had routed it into the TUN.
    pub fn inject(&mut self, packet: &[u8]) -> io::Result<()> {
        self.file.write_all(packet)
    }

    /// The next packet written to the TUN, or `None` after `timeout_ms`.
    pub fn recv_timeout(&mut self, timeout_ms: u16) -> Option<Vec<u8>> {
        let pfd = PollFd::new(self.file.as_fd(), PollFlags::POLLIN);
        match poll(&mut [pfd], PollTimeout::from(timeout_ms)) {
            Ok(n) if n > 0 => {}
            _ => return None,
        }
        let mut buf = vec![0u8; 65536];
        let n = self.file.read(&mut buf).ok()?;
        buf.truncate(n);
        Some(buf)
    }
}

/// Seed `daemon`'s registry with a socketpair-backed device `name` in
/// the default namespace, with a use count of zero.
pub fn install_fake_tun(daemon: &Arc<Daemon>, name: &str) -> Result<TunPeer, TunError> {
    let (dev_end, peer_end) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )
    .map_err(|e| TunError::OpenTun(io::Error::from_raw_os_error(e as i32)))?;

    daemon.install_tun(name.to_string(), File::from(dev_end))?;
    Ok(TunPeer {
        file: File::from(peer_end),
    })
}

/// Minimal IPv4 header plus payload with the given addresses.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64; // TTL
    pkt[9] = 0xfd; // experimental protocol number
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[20..].copy_from_slice(payload);
    pkt
}
