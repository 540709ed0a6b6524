//! Delivering termination signals to supervised processes.
//!
//! Children are spawned as leaders of their own process group so a signal can
//! reach every descendant at once. When group creation did not take effect the
//! signal goes to the single process instead.

use std::io;

/// Signals the supervisor sends to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Interrupt,
    Kill,
}

impl Signal {
    pub fn label(self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
            Signal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Something that can deliver a signal to a spawned child.
pub trait Signaller: Send + Sync {
    fn signal(&self, signal: Signal) -> io::Result<()>;

    /// Whether the target still has live members.
    fn is_alive(&self) -> bool;

    fn describe(&self) -> String;
}

/// Signals an entire process group.
#[derive(Debug, Clone, Copy)]
pub struct GroupSignaller {
    pgid: u32,
}

impl GroupSignaller {
    pub fn new(pgid: u32) -> Self {
        Self { pgid }
    }
}

/// Signals a single process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSignaller {
    pid: u32,
}

impl ProcessSignaller {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

/// Picks the group strategy when `pid` leads its own process group.
pub fn signaller_for(pid: u32) -> Box<dyn Signaller> {
    if leads_own_group(pid) {
        Box::new(GroupSignaller::new(pid))
    } else {
        Box::new(ProcessSignaller::new(pid))
    }
}

#[cfg(unix)]
fn leads_own_group(pid: u32) -> bool {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    pgid >= 0 && pgid as u32 == pid
}

#[cfg(not(unix))]
fn leads_own_group(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn kill(target: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
impl Signaller for GroupSignaller {
    fn signal(&self, signal: Signal) -> io::Result<()> {
        kill(-(self.pgid as libc::pid_t), signal.raw())
    }

    fn is_alive(&self) -> bool {
        // Signal 0 only checks for existence; EPERM still means someone is there.
        match kill(-(self.pgid as libc::pid_t), 0) {
            Ok(()) => true,
            Err(err) => err.raw_os_error() == Some(libc::EPERM),
        }
    }

    fn describe(&self) -> String {
        format!("process group {}", self.pgid)
    }
}

#[cfg(unix)]
impl Signaller for ProcessSignaller {
    fn signal(&self, signal: Signal) -> io::Result<()> {
        kill(self.pid as libc::pid_t, signal.raw())
    }

    fn is_alive(&self) -> bool {
        match kill(self.pid as libc::pid_t, 0) {
            Ok(()) => true,
            Err(err) => err.raw_os_error() == Some(libc::EPERM),
        }
    }

    fn describe(&self) -> String {
        format!("PID {}", self.pid)
    }
}

// No portable way to signal by id here; callers fall back to killing the
// child handle once the grace window expires.
#[cfg(not(unix))]
impl Signaller for GroupSignaller {
    fn signal(&self, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "signals unsupported"))
    }

    fn is_alive(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("process group {}", self.pgid)
    }
}

#[cfg(not(unix))]
impl Signaller for ProcessSignaller {
    fn signal(&self, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "signals unsupported"))
    }

    fn is_alive(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("PID {}", self.pid)
    }
}
