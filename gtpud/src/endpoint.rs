//! GTP endpoint: a bound UDP socket and its decapsulation reader thread.
//!
//! One thread per endpoint reads GTP/UDP datagrams, validates the GTPv1
//! basic header and writes the payload to the TUN device of the tunnel
//! matching (this endpoint, TEID). Endpoints are created on demand by
//! the first tunnel that needs the bind address and die with their last
//! reference.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsFd;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::sys::eventfd::EventFd;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::daemon::Daemon;
use crate::event::{Wake, wait_readable};
use crate::gtp::{self, GTP1_HDR_SIZE, GtpError, MAX_UDP_PACKET};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Cannot bind UDP socket {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error("Cannot create shutdown eventfd: {0}")]
    Eventfd(nix::Error),

    #[error("Cannot start GTP reader thread: {0}")]
    Spawn(io::Error),
}

/// Drop counters kept by the reader thread.
#[derive(Debug, Default)]
pub struct EndpointStats {
    pub short_reads: AtomicU64,
    pub bad_flags: AtomicU64,
    pub bad_msg_type: AtomicU64,
    pub truncated: AtomicU64,
    pub unknown_teid: AtomicU64,
}

impl EndpointStats {
    fn count(&self, err: &GtpError) {
        let ctr = match err {
            GtpError::TooShort(_) => &self.short_reads,
            GtpError::BadFlags(_) => &self.bad_flags,
            GtpError::BadMessageType(_) => &self.bad_msg_type,
            GtpError::Truncated { .. } => &self.truncated,
        };
        ctr.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct GtpEndpoint {
    /// Human-readable "address:port" used in log lines.
    pub name: String,
    /// The bind address as requested; registry key.
    pub bind_addr: SocketAddr,
    socket: UdpSocket,
    /// Number of tunnels holding this endpoint. Mutated only on the
    /// control thread under the registry write lock.
    use_count: AtomicU64,
    shutdown: EventFd,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub stats: EndpointStats,
}

impl GtpEndpoint {
    /// Bind the socket and start the reader thread.
    ///
    /// The new endpoint starts with a use count of zero; the caller
    /// takes the first reference.
    pub(crate) fn create(
        daemon: &Arc<Daemon>,
        bind_addr: SocketAddr,
    ) -> Result<Arc<Self>, EndpointError> {
        let socket = UdpSocket::bind(bind_addr).map_err(|e| EndpointError::Bind(bind_addr, e))?;
        let shutdown = EventFd::new().map_err(EndpointError::Eventfd)?;

        let ep = Arc::new(Self {
            name: bind_addr.to_string(),
            bind_addr,
            socket,
            use_count: AtomicU64::new(0),
            shutdown,
            thread: Mutex::new(None),
            stats: EndpointStats::default(),
        });

        let handle = thread::Builder::new()
            .name(format!("gtp-{}", bind_addr.port()))
            .spawn({
                let daemon = Arc::clone(daemon);
                let ep = Arc::clone(&ep);
                move || run_reader(daemon, ep)
            })
            .map_err(EndpointError::Spawn)?;
        *ep.thread.lock().unwrap() = Some(handle);

        info!(name = %ep.name, "Created GTP endpoint");
        Ok(ep)
    }

    /// The address the socket actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap_or(self.bind_addr)
    }

    /// Transmit an encapsulated packet toward the remote GTP peer.
    /// Safe from any thread; sends are atomic at the kernel layer.
    pub(crate) fn send_to(&self, buf: &[u8], remote: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, remote)
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
            warn!(name = %self.name, error = %e, "Failed to signal endpoint shutdown");
        }
        self.thread.lock().unwrap().take()
    }
}

impl Drop for GtpEndpoint {
    fn drop(&mut self) {
        debug!(name = %self.name, "GTP endpoint closed");
    }
}

/// Decapsulation loop: UDP socket -> TEID lookup -> TUN device.
fn run_reader(daemon: Arc<Daemon>, ep: Arc<GtpEndpoint>) {
    let mut buf = [0u8; MAX_UDP_PACKET + GTP1_HDR_SIZE];

    loop {
        match wait_readable(ep.socket.as_fd(), &ep.shutdown) {
            Wake::Shutdown => break,
            Wake::Readable => {}
        }

        let nread = match ep.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) => {
                // No recovery path for a dead socket; the supervisor
                // restarts the process.
                error!(name = %ep.name, error = %e, "Error reading from UDP socket");
                process::exit(1);
            }
        };

        let (hdr, payload) = match gtp::parse_tpdu(&buf[..nread]) {
            Ok(parsed) => parsed,
            Err(e) => {
                ep.stats.count(&e);
                warn!(name = %ep.name, error = %e, "Dropping GTP datagram");
                continue;
            }
        };

        let Some(tun) = daemon.decap_lookup(&ep, hdr.teid) else {
            ep.stats.unknown_teid.fetch_add(1, Ordering::Relaxed);
            warn!(
                name = %ep.name,
                teid = %format_args!("0x{:08x}", hdr.teid),
                "Unable to find tunnel for TEID"
            );
            continue;
        };

        if let Err(e) = tun.write_packet(payload) {
            error!(name = %ep.name, tun = %tun.name, error = %e, "Error writing to tun device");
            process::exit(1);
        }
    }

    debug!(name = %ep.name, "GTP reader thread exited");
}
