use std::io;
use std::time::Duration;

use nix::errno::Errno;

use crate::phase::Phase;
use crate::ptracer::{Pid, Signal};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not spawn target = {path}")]
    Spawn {
        path: String,
        source: io::Error,
    },

    #[error("Tracee died while tracing = {pid}")]
    TraceeDied {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Tracee = {pid} stopped with {signal}, expected SIGTRAP")]
    UnexpectedSignal { pid: Pid, signal: Signal },

    #[error("Tracee = {pid} exited while waiting for a trap: {status}")]
    TraceeExited { pid: Pid, status: String },

    #[error("Timed out after {elapsed:?} waiting for tracee = {pid}")]
    Timeout { pid: Pid, elapsed: Duration },

    #[error("Breakpoint error at address = {addr:#x}: {kind}")]
    Breakpoint {
        addr: u64,
        kind: BreakpointErrorKind,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Could not access registers of tracee = {pid}")]
    Registers {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not access memory of tracee = {pid} at address = {addr:#x}")]
    Memory {
        pid: Pid,
        addr: u64,
        source: nix::Error,
    },

    #[error("No register named {name:?}")]
    UnknownRegister { name: String },

    #[error("No stack mapping in tracee = {pid}")]
    NoStack { pid: Pid },

    #[error("Could not enumerate memory mappings of tracee = {pid}")]
    Mappings {
        pid: Pid,
        source: io::Error,
    },

    #[error("Cannot enter phase {next:?} from phase {current:?}")]
    PhaseOrder { current: Phase, next: Phase },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakpointErrorKind {
    AlreadyInstalled,
    NotInstalled,
    Patch,
}

impl std::fmt::Display for BreakpointErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            BreakpointErrorKind::AlreadyInstalled => "already installed",
            BreakpointErrorKind::NotInstalled => "not installed",
            BreakpointErrorKind::Patch => "could not patch instruction",
        };

        f.write_str(msg)
    }
}

impl Error {
    /// Returns `true` if the error means the tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } | Error::TraceeExited { .. } => true,
            Error::Registers { source, .. } | Error::Memory { source, .. } => *source == Errno::ESRCH,
            Error::Breakpoint { source: Some(inner), .. } => inner.tracee_died(),
            Error::OS(errno) => *errno == Errno::ESRCH,
            _ => false,
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Reinterpret an `ESRCH` as the death of the tracee `pid`.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid, source },
            source => Error::OS(source),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

pub(crate) use internal_error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esrch_is_tracee_death() {
        let pid = Pid::from_raw(42);
        let res: std::result::Result<(), nix::Error> = Err(Errno::ESRCH);
        let err = res.died_if_esrch(pid).unwrap_err();

        assert!(matches!(err, Error::TraceeDied { .. }));
        assert!(err.tracee_died());
    }

    #[test]
    fn test_other_errno_is_os_error() {
        let pid = Pid::from_raw(42);
        let res: std::result::Result<(), nix::Error> = Err(Errno::EPERM);
        let err = res.died_if_esrch(pid).unwrap_err();

        assert!(matches!(err, Error::OS(Errno::EPERM)));
        assert!(!err.tracee_died());
    }

    #[test]
    fn test_breakpoint_error_inherits_death() {
        let pid = Pid::from_raw(42);
        let inner = Error::Memory { pid, addr: 0x1000, source: Errno::ESRCH };
        let err = Error::Breakpoint {
            addr: 0x1000,
            kind: BreakpointErrorKind::Patch,
            source: Some(Box::new(inner)),
        };

        assert!(err.tracee_died());
        assert_eq!(err.to_string(), "Breakpoint error at address = 0x1000: could not patch instruction");
    }
}
