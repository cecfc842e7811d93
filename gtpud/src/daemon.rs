//! Process-wide daemon root: the three registries and their locking
//! discipline.
//!
//! A single reader-writer lock protects the endpoint, TUN device and
//! tunnel lists. Packet threads take it in read mode for the duration
//! of one lookup and copy out what they need; every mutation happens in
//! write mode on the control thread, which is recorded at construction
//! and asserted. Lookups are linear scans; the expected cardinality is
//! tens to low hundreds of tunnels.
//!
//! Reader threads are never cancelled mid-syscall. Destruction arms the
//! entity's eventfd under the write lock and collects the join handle;
//! the public operations join the retired threads after the lock is
//! released, so a reader blocked on a lookup can still drain out.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, info, warn};

use crate::endpoint::{EndpointError, GtpEndpoint};
use crate::subprocess::SubprocessTable;
use crate::tun::{TunDevice, TunError};
use crate::tunnel::{GtpTunnel, TunnelError, TunnelParams};

#[derive(Default)]
struct Registry {
    endpoints: Vec<Arc<GtpEndpoint>>,
    tun_devices: Vec<Arc<TunDevice>>,
    tunnels: Vec<Arc<GtpTunnel>>,
}

pub struct Daemon {
    registry: RwLock<Registry>,
    control_thread: ThreadId,
    pub subprocesses: SubprocessTable,
}

impl Daemon {
    /// The creating thread becomes the control thread, the only thread
    /// permitted to mutate the registries.
    ///
    /// Not a singleton: tests run several daemons in one process.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            control_thread: thread::current().id(),
            subprocesses: SubprocessTable::default(),
        })
    }

    fn assert_control_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.control_thread,
            "registry mutation outside the control thread"
        );
    }

    // Hot-path lookups. Read lock only; callers copy out what they
    // need and perform I/O after the lock is gone.

    /// Tunnel lookup for the decapsulation path: (this endpoint, TEID).
    pub(crate) fn decap_lookup(&self, ep: &Arc<GtpEndpoint>, teid: u32) -> Option<Arc<TunDevice>> {
        let reg = self.registry.read().unwrap();
        reg.tunnels
            .iter()
            .find(|t| t.rx_teid == teid && Arc::ptr_eq(&t.local_ep, ep))
            .map(|t| Arc::clone(&t.tun))
    }

    /// Tunnel lookup for the encapsulation path: (this device, user IP).
    pub(crate) fn encap_lookup(
        &self,
        dev: &Arc<TunDevice>,
        dst: IpAddr,
    ) -> Option<(u32, Arc<GtpEndpoint>, SocketAddr)> {
        let reg = self.registry.read().unwrap();
        reg.tunnels
            .iter()
            .find(|t| t.user_addr == dst && Arc::ptr_eq(&t.tun, dev))
            .map(|t| (t.tx_teid, Arc::clone(&t.local_ep), t.remote))
    }

    // Control-plane queries.

    /// Device lookup by namespace, for the subprocess launcher.
    pub fn find_tun_by_netns(&self, netns_name: &str) -> Option<Arc<TunDevice>> {
        let reg = self.registry.read().unwrap();
        reg.tun_devices
            .iter()
            .find(|d| d.netns_name.as_deref() == Some(netns_name))
            .map(Arc::clone)
    }

    pub fn find_endpoint(&self, bind: &SocketAddr) -> Option<Arc<GtpEndpoint>> {
        let reg = self.registry.read().unwrap();
        reg.endpoints
            .iter()
            .find(|e| e.bind_addr == *bind)
            .map(Arc::clone)
    }

    pub fn find_tun(&self, name: &str, netns_name: Option<&str>) -> Option<Arc<TunDevice>> {
        let reg = self.registry.read().unwrap();
        reg.tun_devices
            .iter()
            .find(|d| d.matches_key(name, netns_name))
            .map(Arc::clone)
    }

    pub fn endpoint_count(&self) -> usize {
        self.registry.read().unwrap().endpoints.len()
    }

    pub fn tun_count(&self) -> usize {
        self.registry.read().unwrap().tun_devices.len()
    }

    pub fn tunnel_count(&self) -> usize {
        self.registry.read().unwrap().tunnels.len()
    }

    // Lifecycle operations. Write lock, control thread only.

    /// Install a tunnel: reject duplicate keys, take a reference on the
    /// endpoint and the TUN device (creating either on demand), link
    /// the record. On failure the registry is left unchanged.
    pub fn tunnel_create(self: &Arc<Self>, params: &TunnelParams) -> Result<(), TunnelError> {
        self.assert_control_thread();
        let mut retired = Vec::new();
        let result = self.tunnel_create_locked(params, &mut retired);
        join_retired(retired);
        result
    }

    fn tunnel_create_locked(
        self: &Arc<Self>,
        params: &TunnelParams,
        retired: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), TunnelError> {
        let mut reg = self.registry.write().unwrap();

        let rx_key_taken = reg
            .tunnels
            .iter()
            .any(|t| t.local_ep.bind_addr == params.local && t.rx_teid == params.rx_teid);
        let user_key_taken = reg.tunnels.iter().any(|t| {
            t.user_addr == params.user_addr
                && t.tun
                    .matches_key(&params.tun_name, params.tun_netns.as_deref())
        });
        if rx_key_taken || user_key_taken {
            return Err(TunnelError::Duplicate);
        }

        let local_ep = self.endpoint_find_or_create(&mut reg, params.local)?;
        let tun = match self.tun_find_or_create(
            &mut reg,
            &params.tun_name,
            params.tun_netns.as_deref(),
        ) {
            Ok(dev) => dev,
            Err(e) => {
                // Unwind the endpoint reference taken above.
                endpoint_release(&mut reg, &local_ep, retired);
                return Err(e.into());
            }
        };

        let tunnel = Arc::new(GtpTunnel {
            local_ep,
            remote: params.remote,
            tun,
            rx_teid: params.rx_teid,
            tx_teid: params.tx_teid,
            user_addr: params.user_addr,
        });
        info!(tunnel = %tunnel, user = %tunnel.user_addr, "Created tunnel");
        reg.tunnels.push(tunnel);
        Ok(())
    }

    /// Tear down the tunnel identified by (local bind address, rx TEID),
    /// releasing its endpoint and device references.
    pub fn tunnel_destroy(&self, local: &SocketAddr, rx_teid: u32) -> Result<(), TunnelError> {
        self.assert_control_thread();
        let mut retired = Vec::new();
        let result = {
            let mut reg = self.registry.write().unwrap();
            match reg
                .tunnels
                .iter()
                .position(|t| t.local_ep.bind_addr == *local && t.rx_teid == rx_teid)
            {
                Some(pos) => {
                    tunnel_unlink(&mut reg, pos, &mut retired);
                    Ok(())
                }
                None => Err(TunnelError::NotFound),
            }
        };
        join_retired(retired);
        result
    }

    /// Destroy every tunnel referencing the endpoint bound at `bind`,
    /// then the endpoint itself if it is still in the registry.
    pub fn endpoint_force_destroy(&self, bind: &SocketAddr) -> Result<(), TunnelError> {
        self.assert_control_thread();
        let mut retired = Vec::new();
        let result = self.endpoint_force_destroy_locked(bind, &mut retired);
        join_retired(retired);
        result
    }

    fn endpoint_force_destroy_locked(
        &self,
        bind: &SocketAddr,
        retired: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), TunnelError> {
        let mut reg = self.registry.write().unwrap();
        let ep = reg
            .endpoints
            .iter()
            .find(|e| e.bind_addr == *bind)
            .map(Arc::clone)
            .ok_or(TunnelError::NotFound)?;

        while let Some(pos) = reg
            .tunnels
            .iter()
            .position(|t| Arc::ptr_eq(&t.local_ep, &ep))
        {
            tunnel_unlink(&mut reg, pos, retired);
        }

        // The releases above may already have dropped the endpoint from
        // the list; re-check membership before forcing it out.
        if let Some(pos) = reg.endpoints.iter().position(|e| Arc::ptr_eq(e, &ep)) {
            warn!(
                name = %ep.name,
                use_count = ep.use_count(),
                "Destroying endpoint despite non-zero use count"
            );
            reg.endpoints.remove(pos);
            if let Some(handle) = ep.begin_shutdown() {
                retired.push(handle);
            }
        }
        Ok(())
    }

    /// Destroy every tunnel referencing the device (netns, name), then
    /// the device itself if it is still in the registry.
    pub fn tun_force_destroy(
        &self,
        name: &str,
        netns_name: Option<&str>,
    ) -> Result<(), TunnelError> {
        self.assert_control_thread();
        let mut retired = Vec::new();
        let result = self.tun_force_destroy_locked(name, netns_name, &mut retired);
        join_retired(retired);
        result
    }

    fn tun_force_destroy_locked(
        &self,
        name: &str,
        netns_name: Option<&str>,
        retired: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), TunnelError> {
        let mut reg = self.registry.write().unwrap();
        let dev = reg
            .tun_devices
            .iter()
            .find(|d| d.matches_key(name, netns_name))
            .map(Arc::clone)
            .ok_or(TunnelError::NotFound)?;

        while let Some(pos) = reg.tunnels.iter().position(|t| Arc::ptr_eq(&t.tun, &dev)) {
            tunnel_unlink(&mut reg, pos, retired);
        }

        if let Some(pos) = reg.tun_devices.iter().position(|d| Arc::ptr_eq(d, &dev)) {
            warn!(
                name = %dev.name,
                use_count = dev.use_count(),
                "Destroying TUN device despite non-zero use count"
            );
            reg.tun_devices.remove(pos);
            if let Some(handle) = dev.begin_shutdown() {
                retired.push(handle);
            }
        }
        Ok(())
    }

    /// Destroy every tunnel; endpoints and devices collapse through
    /// their refcounts.
    pub fn reset_tunnels(&self) {
        self.assert_control_thread();
        let mut retired = Vec::new();
        {
            let mut reg = self.registry.write().unwrap();
            while !reg.tunnels.is_empty() {
                tunnel_unlink(&mut reg, 0, &mut retired);
            }
        }
        join_retired(retired);
    }

    fn endpoint_find_or_create(
        self: &Arc<Self>,
        reg: &mut Registry,
        bind: SocketAddr,
    ) -> Result<Arc<GtpEndpoint>, EndpointError> {
        let ep = match reg.endpoints.iter().find(|e| e.bind_addr == bind) {
            Some(existing) => Arc::clone(existing),
            None => {
                let ep = GtpEndpoint::create(self, bind)?;
                reg.endpoints.push(Arc::clone(&ep));
                ep
            }
        };
        let count = ep.ref_inc();
        debug!(name = %ep.name, use_count = count, "Endpoint referenced");
        Ok(ep)
    }

    fn tun_find_or_create(
        self: &Arc<Self>,
        reg: &mut Registry,
        name: &str,
        netns_name: Option<&str>,
    ) -> Result<Arc<TunDevice>, TunError> {
        let dev = match reg.tun_devices.iter().find(|d| d.matches_key(name, netns_name)) {
            Some(existing) => Arc::clone(existing),
            None => {
                let dev = TunDevice::create(self, name, netns_name)?;
                reg.tun_devices.push(Arc::clone(&dev));
                dev
            }
        };
        let count = dev.ref_inc();
        debug!(name = %dev.name, use_count = count, "TUN device referenced");
        Ok(dev)
    }

    /// Pre-seed a device backed by an arbitrary descriptor, with a use
    /// count of zero. Test harness hook; see `test_util`.
    pub(crate) fn install_tun(
        self: &Arc<Self>,
        name: String,
        file: std::fs::File,
    ) -> Result<Arc<TunDevice>, TunError> {
        self.assert_control_thread();
        let mut reg = self.registry.write().unwrap();
        let dev = TunDevice::spawn(self, name, None, file)?;
        reg.tun_devices.push(Arc::clone(&dev));
        Ok(dev)
    }
}

/// Unlink the tunnel at `pos` and release both of its references.
fn tunnel_unlink(reg: &mut Registry, pos: usize, retired: &mut Vec<JoinHandle<()>>) {
    let tunnel = reg.tunnels.remove(pos);
    info!(tunnel = %tunnel, "Destroying tunnel");
    endpoint_release(reg, &tunnel.local_ep, retired);
    tun_release(reg, &tunnel.tun, retired);
}

/// Drop one reference; on zero, unlink and shut the reader down.
fn endpoint_release(
    reg: &mut Registry,
    ep: &Arc<GtpEndpoint>,
    retired: &mut Vec<JoinHandle<()>>,
) -> bool {
    let count = ep.ref_dec();
    if count > 0 {
        debug!(name = %ep.name, use_count = count, "Endpoint released");
        return false;
    }
    info!(name = %ep.name, "Destroying endpoint");
    if let Some(pos) = reg.endpoints.iter().position(|e| Arc::ptr_eq(e, ep)) {
        reg.endpoints.remove(pos);
    }
    if let Some(handle) = ep.begin_shutdown() {
        retired.push(handle);
    }
    true
}

fn tun_release(
    reg: &mut Registry,
    dev: &Arc<TunDevice>,
    retired: &mut Vec<JoinHandle<()>>,
) -> bool {
    let count = dev.ref_dec();
    if count > 0 {
        debug!(name = %dev.name, use_count = count, "TUN device released");
        return false;
    }
    info!(name = %dev.name, "Destroying TUN device");
    if let Some(pos) = reg.tun_devices.iter().position(|d| Arc::ptr_eq(d, dev)) {
        reg.tun_devices.remove(pos);
    }
    if let Some(handle) = dev.begin_shutdown() {
        retired.push(handle);
    }
    true
}

/// Join reader threads retired by a destroy operation. Must only be
/// called once the registry lock has been released.
fn join_retired(retired: Vec<JoinHandle<()>>) {
    for handle in retired {
        let _ = handle.join();
    }
}
