/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

//! Breakpoint-driven function tracing over ptrace.
//!
//! The bottom layer is a typed ptrace API in the style of a state machine:
//! operations that require a stopped tracee are only callable on a
//! [`Stopped`] value, and resuming consumes it into a [`Running`] value
//! whose only capability is to be waited on. This makes it impossible to
//! issue a ptrace request against a tracee that is not in a ptrace-stop.
//!
//! On top of that sit the [`Breakpoint`] engine and the
//! [`InvocationTracker`], which delimits invocations of a single traced
//! function and reports one [`InvocationRecord`] per completed invocation.

mod breakpoint;
mod memory;
mod regs;
mod spawn;
mod tracker;

use std::fmt;

use nix::sys::ptrace;
// Re-exports so that callers don't need to depend on `nix` directly.
pub use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
pub use nix::unistd::Pid;
pub use syscalls::Errno;
use thiserror::Error;

pub use crate::breakpoint::Breakpoint;
pub use crate::breakpoint::BREAKPOINT_LEN;
pub use crate::memory::TextMemory;
pub use crate::regs::Regs;
pub use crate::spawn::spawn;
pub use crate::tracker::InvocationRecord;
pub use crate::tracker::InvocationTracker;
pub use crate::tracker::Mode;
pub use crate::tracker::RecordSink;
pub use crate::tracker::SyscallFailure;

/// An error that occurred during tracing.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    /// A low-level errno.
    #[error(transparent)]
    Errno(#[from] Errno),

    /// The tracee died while we believed it to be stopped. Once this is
    /// observed the session cannot continue; no further control operation
    /// may be issued against the process.
    #[error("tracee {0} died mid-session")]
    Died(Pid),
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Errno(Errno::new(err as i32))
    }
}

/// Describes the result of a process after it has exited.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitStatus {
    /// Program exited with an exit code.
    Exited(i32),
    /// Program killed by a signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// Was termination successful? Signal termination is not considered a
    /// success.
    pub fn success(&self) -> bool {
        self == &ExitStatus::Exited(0)
    }

    /// The exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "killed by {}", sig),
        }
    }
}

/// The result of a blocking wait. A process in this state is guaranteed to
/// not be in a running state.
///
/// `Clone` and `Copy` are intentionally not implemented to enforce type
/// safety.
#[derive(Debug, Eq, PartialEq)]
pub enum Wait {
    /// The process is in a ptrace-stop after delivery of the given signal.
    /// Only stopped processes allow ptrace operations.
    Stopped(Stopped, Signal),

    /// The process has exited.
    Exited(Pid, ExitStatus),
}

impl Wait {
    /// Returns the PID for this state.
    pub fn pid(&self) -> Pid {
        match self {
            Self::Stopped(Stopped(pid), _) => *pid,
            Self::Exited(pid, _) => *pid,
        }
    }
}

impl From<WaitStatus> for Wait {
    /// Converts a `WaitStatus` to this type.
    ///
    /// Preconditions:
    /// The process must not be in a `StillAlive` state, and tracing must not
    /// have requested ptrace events or syscall stops (this crate never
    /// does).
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(pid, code) => Self::Exited(pid, ExitStatus::Exited(code)),
            WaitStatus::Signaled(pid, sig, _coredump) => {
                Self::Exited(pid, ExitStatus::Signaled(sig))
            }
            WaitStatus::Stopped(pid, sig) => Self::Stopped(Stopped(pid), sig),
            WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_) => {
                // Not possible because no ptrace options are ever set.
                unreachable!("unexpected ptrace event without options set");
            }
            WaitStatus::Continued(_) => {
                // Not possible because WaitPidFlag::WCONTINUED is never used.
                unreachable!("unexpected WaitStatus::Continued");
            }
            WaitStatus::StillAlive => {
                // The precondition of this function forbids this.
                unreachable!("precondition violated with WaitStatus::StillAlive");
            }
        }
    }
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stopped(stopped, sig) => {
                write!(f, "pid {} stopped ({})", stopped.pid(), sig)
            }
            Self::Exited(pid, status) => write!(f, "pid {} {}", pid, status),
        }
    }
}

/// A process that is in a ptrace-stop and allows ptrace operations to be
/// performed.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Stopped(Pid);

impl Stopped {
    /// Helper for converting from the nix error type.
    ///
    /// According to ptrace(2), any ptrace operation may return ESRCH when
    /// the process observed to be in a stopped state has died unexpectedly.
    /// The other ESRCH causes (not traced, not stopped) are ruled out by
    /// this API's construction, so ESRCH here always means the tracee is
    /// gone.
    pub(crate) fn map_nix_err(&self, err: nix::errno::Errno) -> Error {
        if err == nix::errno::Errno::ESRCH {
            Error::Died(self.0)
        } else {
            Error::Errno(Errno::new(err as i32))
        }
    }

    /// Returns the process ID of the tracee.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Gets the current state of the general purpose registers.
    pub fn getregs(&self) -> Result<Regs, Error> {
        ptrace::getregs(self.0).map_err(|err| self.map_nix_err(err))
    }

    /// Sets the general purpose registers.
    pub fn setregs(&self, regs: &Regs) -> Result<(), Error> {
        ptrace::setregs(self.0, *regs).map_err(|err| self.map_nix_err(err))
    }

    /// Resumes the process and transitions it back to a running state,
    /// optionally delivering a signal.
    pub fn resume<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::cont(self.0, sig.into()).map_err(|err| self.map_nix_err(err))?;
        Ok(Running(self.0))
    }

    /// Advances the execution of the process by a single instruction,
    /// optionally delivering a signal.
    pub fn step<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::step(self.0, sig.into()).map_err(|err| self.map_nix_err(err))?;
        Ok(Running(self.0))
    }
}

/// A running tracee. The only thing that can be done with it is to wait for
/// its next stop.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Running(Pid);

impl Running {
    /// Creates a new running process handle. This is the entry point for a
    /// freshly spawned tracee.
    pub fn new(pid: Pid) -> Self {
        Running(pid)
    }

    /// Returns the pid of the running process.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Blocks until a state change occurs. This transitions the process to
    /// either a stopped state or an exited state, never a running state.
    pub fn wait(self) -> Result<Wait, Error> {
        loop {
            match waitpid(self.0, None) {
                Ok(status) => return Ok(Wait::from(status)),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}
