//! Shutdown-aware readiness wait shared by the reader threads.
//!
//! Destruction never cancels a reader mid-syscall: the control thread
//! arms the per-entity eventfd, the reader's poll wakes, and the thread
//! exits on its own before the descriptor is dropped.

use std::os::fd::{AsFd, BorrowedFd};
use std::process;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::EventFd;
use tracing::error;

/// Why the reader woke up.
pub(crate) enum Wake {
    Readable,
    Shutdown,
}

/// Block until `io` is readable or `shutdown` has been armed.
pub(crate) fn wait_readable(io: BorrowedFd<'_>, shutdown: &EventFd) -> Wake {
    loop {
        let mut fds = [
            PollFd::new(io, PollFlags::POLLIN),
            PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "poll failed on reader thread");
                process::exit(1);
            }
        }
        if fds[1].revents().is_some_and(|r| !r.is_empty()) {
            return Wake::Shutdown;
        }
        // Treat error conditions as readable so the subsequent read
        // surfaces the failure.
        let io_ready = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        if fds[0].revents().is_some_and(|r| r.intersects(io_ready)) {
            return Wake::Readable;
        }
    }
}
