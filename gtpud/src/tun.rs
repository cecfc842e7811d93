//! TUN device: a layer-3 virtual interface and its encapsulation
//! reader thread.
//!
//! Devices are created on demand by the first tunnel referencing
//! (namespace, name) and die with their last reference. Creation may
//! happen inside a named network namespace; the control thread enters
//! the namespace only for the duration of the open and the namespace
//! handle is kept for launching subprocesses there later. The TUN fd
//! itself keeps working from any namespace once it is open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::libc;
use nix::sys::eventfd::EventFd;
use smoltcp::wire::{Ipv4Packet, Ipv6Packet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::daemon::Daemon;
use crate::event::{Wake, wait_readable};
use crate::gtp::{self, GTP1_HDR_SIZE, MAX_UDP_PACKET};
use crate::netns::{NetnsError, NetnsHandle};

/// TUN device flags from linux/if_tun.h: layer 3, no packet-info prefix.
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[derive(Debug, Error)]
pub enum TunError {
    #[error("TUN device name too long: {0}")]
    NameTooLong(String),

    #[error("Failed to open /dev/net/tun: {0}")]
    OpenTun(io::Error),

    #[error("Failed to create TUN device '{0}': {1}")]
    CreateDevice(String, io::Error),

    #[error(transparent)]
    Netns(#[from] NetnsError),

    #[error("Cannot create shutdown eventfd: {0}")]
    Eventfd(nix::Error),

    #[error("Cannot start TUN reader thread: {0}")]
    Spawn(io::Error),
}

pub struct TunDevice {
    /// Interface name; unique within its namespace.
    pub name: String,
    /// Namespace the device was created in; `None` for the default.
    pub netns_name: Option<String>,
    file: File,
    /// Kept open so subprocesses can be moved into the namespace.
    netns: Option<NetnsHandle>,
    /// Number of tunnels holding this device. Mutated only on the
    /// control thread under the registry write lock.
    use_count: AtomicU64,
    shutdown: EventFd,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Packets read from the TUN with no matching tunnel.
    pub no_tunnel_drops: AtomicU64,
}

impl TunDevice {
    /// Create the interface (optionally inside `netns_name`) and start
    /// the reader thread. The namespace is restored before returning,
    /// also on failure.
    ///
    /// The new device starts with a use count of zero; the caller takes
    /// the first reference.
    pub(crate) fn create(
        daemon: &Arc<Daemon>,
        name: &str,
        netns_name: Option<&str>,
    ) -> Result<Arc<Self>, TunError> {
        let netns = netns_name.map(NetnsHandle::open).transpose()?;
        let file = {
            let _guard = netns.as_ref().map(|ns| ns.enter()).transpose()?;
            open_tun(name)?
        };
        Self::spawn(daemon, name.to_string(), netns, file)
    }

    /// Wrap an already-open descriptor and start the reader thread.
    /// Used by the test harness to stand in a socketpair for the TUN.
    pub(crate) fn spawn(
        daemon: &Arc<Daemon>,
        name: String,
        netns: Option<NetnsHandle>,
        file: File,
    ) -> Result<Arc<Self>, TunError> {
        let shutdown = EventFd::new().map_err(TunError::Eventfd)?;

        let dev = Arc::new(Self {
            netns_name: netns.as_ref().map(|ns| ns.name().to_string()),
            name,
            file,
            netns,
            use_count: AtomicU64::new(0),
            shutdown,
            thread: Mutex::new(None),
            no_tunnel_drops: AtomicU64::new(0),
        });

        let handle = thread::Builder::new()
            .name(format!("tun-{}", dev.name))
            .spawn({
                let daemon = Arc::clone(daemon);
                let dev = Arc::clone(&dev);
                move || run_reader(daemon, dev)
            })
            .map_err(TunError::Spawn)?;
        *dev.thread.lock().unwrap() = Some(handle);

        info!(name = %dev.name, netns = ?dev.netns_name, "Created TUN device");
        Ok(dev)
    }

    /// Registry identity: (namespace, name).
    pub(crate) fn matches_key(&self, name: &str, netns_name: Option<&str>) -> bool {
        self.name == name && self.netns_name.as_deref() == netns_name
    }

    /// The kept namespace handle, for subprocess entry.
    pub fn netns(&self) -> Option<&NetnsHandle> {
        self.netns.as_ref()
    }

    /// Deliver a decapsulated IP packet into the kernel.
    /// Safe from any thread holding a reference.
    pub(crate) fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let n = (&self.file).write(packet)?;
        if n < packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to tun: {n} < {}", packet.len()),
            ));
        }
        Ok(())
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub(crate) fn ref_inc(&self) -> u64 {
        self.use_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn ref_dec(&self) -> u64 {
        self.use_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Wake the reader thread and hand its join handle to the caller.
    /// Called under the registry write lock; joining happens after the
    /// lock is released.
    pub(crate) fn begin_shutdown(&self) -> Option<JoinHandle<()>> {
        if let Err(e) = self.shutdown.write(1) {
            warn!(name = %self.name, error = %e, "Failed to signal TUN shutdown");
        }
        self.thread.lock().unwrap().take()
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN device closed");
    }
}

/// Open /dev/net/tun and attach it to a layer-3 interface `name`.
fn open_tun(name: &str) -> Result<File, TunError> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(TunError::NameTooLong(name.to_string()));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(TunError::OpenTun)?;

    let mut ifr = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (i, &b) in name.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as libc::Ioctl, &ifr) };
    if ret < 0 {
        return Err(TunError::CreateDevice(
            name.to_string(),
            io::Error::last_os_error(),
        ));
    }

    Ok(file)
}

/// Encapsulation loop: TUN read -> user-IP lookup -> GTP header ->
/// sendto on the tunnel's endpoint.
fn run_reader(daemon: Arc<Daemon>, dev: Arc<TunDevice>) {
    // Room for the GTP header ahead of the payload so the header is
    // prepended in place.
    let mut buf = [0u8; GTP1_HDR_SIZE + MAX_UDP_PACKET];

    loop {
        match wait_readable(dev.file.as_fd(), &dev.shutdown) {
            Wake::Shutdown => break,
            Wake::Readable => {}
        }

        let nread = match (&dev.file).read(&mut buf[GTP1_HDR_SIZE..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(name = %dev.name, error = %e, "Error reading from tun device");
                process::exit(1);
            }
        };

        let payload = &buf[GTP1_HDR_SIZE..GTP1_HDR_SIZE + nread];
        let Some(dst) = destination_ip(payload) else {
            warn!(name = %dev.name, len = nread, "Dropping unparseable packet from tun");
            continue;
        };

        let Some((tx_teid, ep, remote)) = daemon.encap_lookup(&dev, dst) else {
            dev.no_tunnel_drops.fetch_add(1, Ordering::Relaxed);
            warn!(name = %dev.name, dst = %dst, "Unable to find tunnel for user address");
            continue;
        };

        gtp::write_tpdu_header(&mut buf[..GTP1_HDR_SIZE], tx_teid, nread as u16);
        if let Err(e) = ep.send_to(&buf[..GTP1_HDR_SIZE + nread], remote) {
            // Transient UDP errors (e.g. ICMP unreachable) are not fatal.
            warn!(name = %dev.name, remote = %remote, error = %e, "Failed to send GTP datagram");
        }
    }

    debug!(name = %dev.name, "TUN reader thread exited");
}

/// Destination address of the IP datagram read from the TUN.
fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => Ipv4Packet::new_checked(packet)
            .ok()
            .map(|p| IpAddr::V4(p.dst_addr().into())),
        6 => Ipv6Packet::new_checked(packet)
            .ok()
            .map(|p| IpAddr::V6(p.dst_addr().into())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn destination_of_ipv4_packet() {
        let mut pkt = [0u8; 20];
        pkt[0] = 0x45; // version 4, IHL 5
        pkt[2..4].copy_from_slice(&20u16.to_be_bytes()); // total length
        pkt[16..20].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        assert_eq!(
            destination_ip(&pkt),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        );
    }

    #[test]
    fn destination_of_ipv6_packet() {
        let mut pkt = [0u8; 40];
        pkt[0] = 0x60;
        let dst: Ipv6Addr = "2001:db8::7".parse().unwrap();
        pkt[24..40].copy_from_slice(&dst.octets());
        assert_eq!(destination_ip(&pkt), Some(IpAddr::V6(dst)));
    }

    #[test]
    fn garbage_has_no_destination() {
        assert_eq!(destination_ip(&[]), None);
        assert_eq!(destination_ip(&[0x00, 0x01]), None);
        // Version nibble says 4 but the header is truncated.
        assert_eq!(destination_ip(&[0x45, 0x00, 0x00]), None);
    }
}
