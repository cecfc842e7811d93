//! Subprocess launcher for `start_program`.
//!
//! Children run inside the network namespace of the TUN device serving
//! that namespace, as the requested user, with a whitelisted
//! environment. Each child is tracked with the control session that
//! started it: the session gets a `program_term_ind` when the child
//! exits, and every child of a session is killed when the session goes
//! away.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, User};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use gtpud_proto::{ProgramTermInd, Response, ResultCode, StartProgram, StartProgramRes};

use crate::daemon::Daemon;

/// Environment variables a child may inherit from the daemon.
const ENV_WHITELIST: &[&str] = &[
    "USER", "LOGNAME", "HOME", "LANG", "LANGUAGE", "LC_ALL", "PATH", "PWD", "SHELL", "TERM",
    "TMPDIR",
];

#[derive(Debug, Clone, Copy)]
struct Entry {
    pid: i32,
    session: u64,
}

/// Children launched via `start_program`, keyed by PID.
///
/// Only touched from the control thread, like the other registries.
#[derive(Default)]
pub struct SubprocessTable {
    inner: Mutex<Vec<Entry>>,
}

impl SubprocessTable {
    fn track(&self, pid: i32, session: u64) {
        self.inner.lock().unwrap().push(Entry { pid, session });
    }

    /// Forget a child; returns false if it was already gone.
    fn remove(&self, pid: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.iter().position(|entry| entry.pid == pid) {
            Some(pos) => {
                inner.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// SIGKILL and forget every child the session launched.
    pub fn kill_session(&self, session: u64) {
        self.inner.lock().unwrap().retain(|entry| {
            if entry.session != session {
                return true;
            }
            info!(pid = entry.pid, session, "Killing subprocess of closed session");
            kill_pid(entry.pid);
            false
        });
    }

    /// SIGKILL and forget every tracked child.
    pub fn kill_all(&self) {
        self.inner.lock().unwrap().retain(|entry| {
            info!(pid = entry.pid, session = entry.session, "Killing subprocess");
            kill_pid(entry.pid);
            false
        });
    }
}

fn kill_pid(pid: i32) {
    // The child may already have been reaped; nothing to do then.
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "Failed to kill subprocess");
    }
}

/// Handle one `start_program` command for `session`.
///
/// Runs on the control thread; the namespace is entered and restored
/// around the (synchronous) spawn without yielding in between.
pub fn start_program(
    daemon: &Arc<Daemon>,
    session: u64,
    events: UnboundedSender<Value>,
    req: &StartProgram,
) -> StartProgramRes {
    const INVALID: StartProgramRes = StartProgramRes {
        result: ResultCode::InvalidData,
        pid: 0,
    };

    let user = match User::from_name(&req.run_as_user) {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(user = %req.run_as_user, "Unknown run_as_user");
            return INVALID;
        }
        Err(e) => {
            warn!(user = %req.run_as_user, error = %e, "Cannot resolve run_as_user");
            return INVALID;
        }
    };

    let netns_tun = match &req.tun_netns_name {
        Some(name) => match daemon.find_tun_by_netns(name) {
            Some(tun) => Some(tun),
            None => {
                warn!(netns = %name, "No TUN device in requested netns");
                return INVALID;
            }
        },
        None => None,
    };

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&req.command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .env_clear()
        .uid(user.uid.as_raw())
        .gid(user.gid.as_raw());
    for key in ENV_WHITELIST {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    for entry in &req.environment {
        let Some((key, value)) = entry.split_once('=') else {
            warn!(entry = %entry, "Malformed environment entry");
            return INVALID;
        };
        cmd.env(key, value);
    }

    let spawned = {
        let _guard = match netns_tun.as_ref().and_then(|tun| tun.netns()) {
            Some(ns) => match ns.enter() {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(error = %e, "Cannot enter netns for subprocess");
                    return INVALID;
                }
            },
            None => None,
        };
        cmd.spawn()
    };

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %req.command, error = %e, "Failed to spawn subprocess");
            return INVALID;
        }
    };
    let Some(pid) = child.id().map(|pid| pid as i32) else {
        warn!(command = %req.command, "Subprocess exited before it was tracked");
        return INVALID;
    };

    daemon.subprocesses.track(pid, session);
    info!(pid, session, command = %req.command, "Started subprocess");

    let daemon = Arc::clone(daemon);
    tokio::spawn(async move {
        let exit_code = match child.wait().await {
            Ok(status) => exit_code_of(&status),
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for subprocess");
                -1
            }
        };
        debug!(pid, exit_code, "Subprocess terminated");

        if !daemon.subprocesses.remove(pid) {
            // Already killed and forgotten; the owning session is gone.
            debug!(pid, "Terminated subprocess was no longer tracked");
            return;
        }
        let ind = Response::ProgramTermInd(ProgramTermInd { pid, exit_code });
        let msg = serde_json::to_value(&ind).expect("indication serialization cannot fail");
        if events.send(msg).is_err() {
            debug!(pid, "Owning session closed; dropping program_term_ind");
        }
    });

    StartProgramRes {
        result: ResultCode::Ok,
        pid,
    }
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
