/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ffi::CString;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use nix::sys::ptrace;
use nix::unistd::execv;
use nix::unistd::fork;
use nix::unistd::ForkResult;

use crate::Error;
use crate::Errno;
use crate::Running;

/// Forks and execs `program` under tracing control.
///
/// The child requests to be traced before any target instruction runs, so
/// the parent's first wait observes the post-execve trap. `args` become the
/// target's own argv, with `argv[0]` set to the program path; the target
/// inherits the tracer's stdio. Returns without blocking on target
/// progress.
///
/// Any child-side failure (traceme or execve) terminates the child with a
/// nonzero status; the session then ends at the tracker's first wait.
pub fn spawn<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> Result<Running, Error> {
    let path = cstring(program)?;
    let mut argv = vec![path.clone()];
    for arg in args {
        argv.push(cstring(arg.as_ref())?);
    }
    // Everything the child needs is materialized before the fork so that
    // the child side only issues async-signal-safe operations.
    let argv: Vec<&std::ffi::CStr> = argv.iter().map(|a| a.as_c_str()).collect();

    match unsafe { fork() }.map_err(Error::from)? {
        ForkResult::Parent { child } => Ok(Running::new(child)),
        ForkResult::Child => {
            let _ = ptrace::traceme().and_then(|()| execv(&path, &argv));
            // Only reached if traceme or execve failed.
            unsafe { libc::_exit(127) }
        }
    }
}

fn cstring(s: &OsStr) -> Result<CString, Error> {
    CString::new(s.as_bytes()).map_err(|_| Error::Errno(Errno::EINVAL))
}
