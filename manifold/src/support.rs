//! Shared error plumbing for the routing core.
//!
//! Two error families live here. `NetworkError` is the transport-level
//! split between "would block, come back later" and "this channel is dead",
//! used by the buffer and channel layer. `BusError` is a driver-visible
//! failure with a stable dotted wire name, produced while processing one
//! incoming message and ultimately delivered to the peer as an error reply.

use crate::ERROR_PREFIX;
use std::fmt;
use std::io;

/// Category of a transport-level fatal error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    Io,
    Closed,
    BadFrame,
    FrameTooLarge,
    BufferOverrun,
}

/// Result of a non-blocking transport operation. `Wait` is not a failure;
/// the caller retries once the loop reports readiness again.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            _ => NetworkError::Fatal(ErrorType::Io),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

pub trait ErrorUtils {
    /// Returns true in case of a fatal error. `Wait` does not count.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Err(NetworkError::Fatal(_)) => true,
            _ => false,
        }
    }
}

/// Design-level category of a driver-visible failure. Each kind maps onto
/// exactly one stable dotted name on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    NoMemory,
    ServiceNotFound,
    ServiceDoesNotExist,
    NameHasNoOwner,
    SpawnExecFailed,
    ChildExited,
    ChildSignaled,
    SpawnFailed,
    AccessDenied,
    LimitsExceeded,
    UnknownMethod,
    InvalidArgs,
    MatchRuleNotFound,
    Timeout,
    Disconnected,
    Failed,
}

impl ErrorKind {
    /// The stable dotted error name put on the wire for this kind.
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::NoMemory => "org.busbar.Bus.Error.NoMemory",
            ErrorKind::ServiceNotFound => "org.busbar.Bus.Error.ServiceNotFound",
            ErrorKind::ServiceDoesNotExist => "org.busbar.Bus.Error.ServiceDoesNotExist",
            ErrorKind::NameHasNoOwner => "org.busbar.Bus.Error.NameHasNoOwner",
            ErrorKind::SpawnExecFailed => "org.busbar.Bus.Error.Spawn.ExecFailed",
            ErrorKind::ChildExited => "org.busbar.Bus.Error.Spawn.ChildExited",
            ErrorKind::ChildSignaled => "org.busbar.Bus.Error.Spawn.ChildSignaled",
            ErrorKind::SpawnFailed => "org.busbar.Bus.Error.Spawn.Failed",
            ErrorKind::AccessDenied => "org.busbar.Bus.Error.AccessDenied",
            ErrorKind::LimitsExceeded => "org.busbar.Bus.Error.LimitsExceeded",
            ErrorKind::UnknownMethod => "org.busbar.Bus.Error.UnknownMethod",
            ErrorKind::InvalidArgs => "org.busbar.Bus.Error.InvalidArgs",
            ErrorKind::MatchRuleNotFound => "org.busbar.Bus.Error.MatchRuleNotFound",
            ErrorKind::Timeout => "org.busbar.Bus.Error.Timeout",
            ErrorKind::Disconnected => "org.busbar.Bus.Error.Disconnected",
            ErrorKind::Failed => "org.busbar.Bus.Error.Failed",
        }
    }

    /// Reverse mapping used when reflecting wire errors back into kinds.
    /// Unknown names under the error prefix fold into `Failed`.
    pub fn from_wire_name(name: &str) -> Option<ErrorKind> {
        const ALL: &[ErrorKind] = &[
            ErrorKind::NoMemory,
            ErrorKind::ServiceNotFound,
            ErrorKind::ServiceDoesNotExist,
            ErrorKind::NameHasNoOwner,
            ErrorKind::SpawnExecFailed,
            ErrorKind::ChildExited,
            ErrorKind::ChildSignaled,
            ErrorKind::SpawnFailed,
            ErrorKind::AccessDenied,
            ErrorKind::LimitsExceeded,
            ErrorKind::UnknownMethod,
            ErrorKind::InvalidArgs,
            ErrorKind::MatchRuleNotFound,
            ErrorKind::Timeout,
            ErrorKind::Disconnected,
            ErrorKind::Failed,
        ];

        for kind in ALL {
            if kind.wire_name() == name {
                return Some(*kind);
            }
        }

        if name.starts_with(ERROR_PREFIX) {
            return Some(ErrorKind::Failed);
        }

        None
    }
}

/// A failure produced while processing one incoming message.
#[derive(Debug)]
pub struct BusError {
    kind: ErrorKind,
    detail: String,
}

impl BusError {
    #[inline]
    pub fn new<S: Into<String>>(kind: ErrorKind, detail: S) -> BusError {
        BusError {
            kind,
            detail: detail.into(),
        }
    }

    #[inline]
    pub fn no_memory() -> BusError {
        BusError::new(ErrorKind::NoMemory, "out of memory")
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.wire_name(), self.detail)
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Deterministic allocation-failure injector. Every staging or
/// table-mutation site in the core consults the guard before committing
/// memory to new state. In normal operation every check succeeds; tests arm
/// the guard to fail from the Nth checkpoint onward, which models a process
/// under memory pressure where every further allocation keeps failing until
/// pressure clears (`disarm`).
pub struct MemGuard {
    countdown: Option<u64>,
}

impl MemGuard {
    #[inline]
    pub fn new() -> MemGuard {
        MemGuard { countdown: None }
    }

    /// Checkpoint. Fails with `NoMemory` once the armed countdown reaches
    /// zero and keeps failing until `disarm`.
    #[inline]
    pub fn check(&mut self) -> BusResult<()> {
        match self.countdown {
            None => Ok(()),
            Some(0) => Err(BusError::no_memory()),
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
        }
    }

    /// Arms the guard: the next `n` checks succeed, every one after fails.
    #[inline]
    pub fn fail_after(&mut self, n: u64) {
        self.countdown = Some(n);
    }

    #[inline]
    pub fn disarm(&mut self) {
        self.countdown = None;
    }

    /// True once the guard has started rejecting checks.
    #[inline]
    pub fn exhausted(&self) -> bool {
        self.countdown == Some(0)
    }
}
