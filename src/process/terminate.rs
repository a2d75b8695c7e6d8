//! Process termination strategies
//!
//! A plain signal reaches only the process it is sent to. Wrapped tools that
//! launch their own workers need the whole tree taken down, which is what
//! `TreeSignal` does. The strategy is picked once per `ProcessContext`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sysinfo::System;
use tracing::debug;

use crate::error::{ProcessError, Result};

/// Signal requested by `ProcessController::kill`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TermSignal {
    #[default]
    Terminate,
    Kill,
    Interrupt,
    Hangup,
}

impl TermSignal {
    /// POSIX name of the signal
    pub fn as_str(&self) -> &'static str {
        match self {
            TermSignal::Terminate => "SIGTERM",
            TermSignal::Kill => "SIGKILL",
            TermSignal::Interrupt => "SIGINT",
            TermSignal::Hangup => "SIGHUP",
        }
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            TermSignal::Terminate => Signal::SIGTERM,
            TermSignal::Kill => Signal::SIGKILL,
            TermSignal::Interrupt => Signal::SIGINT,
            TermSignal::Hangup => Signal::SIGHUP,
        }
    }

    #[cfg(not(unix))]
    fn to_sysinfo(self) -> sysinfo::Signal {
        match self {
            TermSignal::Terminate => sysinfo::Signal::Term,
            TermSignal::Kill => sysinfo::Signal::Kill,
            TermSignal::Interrupt => sysinfo::Signal::Interrupt,
            TermSignal::Hangup => sysinfo::Signal::Hangup,
        }
    }
}

impl std::fmt::Display for TermSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers a termination request to a running process
pub trait Terminator: Send + Sync {
    /// Signal `pid`. A process that is already gone is not an error.
    fn terminate(&self, pid: u32, signal: TermSignal) -> Result<()>;
}

/// Signals only the controlled process
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectSignal;

/// Signals the controlled process and every descendant
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeSignal;

/// Pick the termination strategy for this platform
pub fn platform_terminator() -> Arc<dyn Terminator> {
    if cfg!(windows) {
        Arc::new(TreeSignal)
    } else {
        Arc::new(DirectSignal)
    }
}

impl Terminator for DirectSignal {
    fn terminate(&self, pid: u32, signal: TermSignal) -> Result<()> {
        debug!(pid, signal = %signal, "Sending signal");
        send_signal(pid, signal)
    }
}

impl Terminator for TreeSignal {
    #[cfg(windows)]
    fn terminate(&self, pid: u32, signal: TermSignal) -> Result<()> {
        use std::process::{Command, Stdio};

        debug!(pid, signal = %signal, "Killing process tree with taskkill");
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        // 128: no such process
        if !status.success() && status.code() != Some(128) {
            return Err(ProcessError::Signal {
                pid,
                reason: format!("taskkill exited with {:?}", status.code()),
            });
        }
        Ok(())
    }

    #[cfg(not(windows))]
    fn terminate(&self, pid: u32, signal: TermSignal) -> Result<()> {
        let tree = process_tree(pid);
        debug!(pid, signal = %signal, members = tree.len(), "Signalling process tree");

        // Root first so it cannot respawn workers we are about to kill
        let mut first_err = None;
        for member in tree {
            if let Err(e) = send_signal(member, signal) {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `root` followed by all of its descendants, breadth-first
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut tree = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !tree.contains(&kid) {
                    tree.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    tree
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TermSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        reason: "PID out of range".to_string(),
    })?;

    match kill(NixPid::from_raw(raw), signal.to_nix()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: TermSignal) -> Result<()> {
    let mut sys = System::new();
    sys.refresh_processes();

    let Some(process) = sys.process(sysinfo::Pid::from_u32(pid)) else {
        return Ok(());
    };

    match process.kill_with(signal.to_sysinfo()) {
        Some(true) => Ok(()),
        Some(false) => Err(ProcessError::Signal {
            pid,
            reason: "kill request rejected".to_string(),
        }),
        None => Err(ProcessError::Signal {
            pid,
            reason: format!("{signal} is not supported on this platform"),
        }),
    }
}
