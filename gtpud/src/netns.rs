//! Network namespace entry and restore.
//!
//! TUN creation and subprocess launch may have to happen inside a named
//! namespace. Both run on the control thread: enter the namespace, do
//! the privileged work, restore the previous namespace before anything
//! else gets to run on that thread.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::fcntl::{OFlag, open};
use nix::sched::{CloneFlags, setns};
use nix::sys::stat::Mode;
use thiserror::Error;
use tracing::error;

/// Where `ip netns` materializes named namespaces.
const NETNS_RUN_DIR: &str = "/run/netns";

/// The calling thread's own namespace, reopened for restore.
const SELF_NS_PATH: &str = "/proc/self/ns/net";

#[derive(Debug, Error)]
pub enum NetnsError {
    #[error("Cannot open netns '{0}': {1}")]
    Open(String, nix::Error),

    #[error("Cannot open current netns: {0}")]
    OpenSelf(nix::Error),

    #[error("Cannot enter netns: {0}")]
    Enter(nix::Error),
}

/// An open handle on a named network namespace.
///
/// Kept alive for the lifetime of the TUN device that was created in it,
/// so subprocesses can be moved into the namespace later.
#[derive(Debug)]
pub struct NetnsHandle {
    name: String,
    fd: OwnedFd,
}

impl NetnsHandle {
    pub fn open(name: &str) -> Result<Self, NetnsError> {
        let path = format!("{NETNS_RUN_DIR}/{name}");
        let fd = open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| NetnsError::Open(name.to_string(), e))?;
        Ok(Self {
            name: name.to_string(),
            fd,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Switch the calling thread into this namespace.
    ///
    /// The returned guard switches back when dropped. Do not yield to
    /// other tasks while holding it.
    pub fn enter(&self) -> Result<NetnsGuard, NetnsError> {
        let previous = open(SELF_NS_PATH, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(NetnsError::OpenSelf)?;
        setns(self.fd.as_fd(), CloneFlags::CLONE_NEWNET).map_err(NetnsError::Enter)?;
        Ok(NetnsGuard { previous })
    }
}

impl AsFd for NetnsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Restores the thread's previous namespace on drop.
pub struct NetnsGuard {
    previous: OwnedFd,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // A thread stuck in a foreign namespace would corrupt every
        // later privileged operation; this must not be survivable.
        if let Err(e) = setns(self.previous.as_fd(), CloneFlags::CLONE_NEWNET) {
            error!(error = %e, "Failed to restore network namespace");
            panic!("failed to restore network namespace: {e}");
        }
    }
}
