/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use fntrace_elf::ResolvedTarget;

use crate::breakpoint::Breakpoint;
use crate::breakpoint::BREAKPOINT_LEN;
use crate::Error;
use crate::ExitStatus;
use crate::Running;
use crate::Signal;
use crate::Stopped;
use crate::TextMemory;
use crate::Wait;

/// Width of a return address on the stack. A genuine return leaves the
/// stack pointer exactly this far above the frame marker recorded at entry.
const RET_ADDR_LEN: u64 = 8;

/// The two-byte `syscall` instruction, matched against the low bytes of the
/// word at the program counter.
const SYSCALL_INSN: u64 = 0x050f;
const SYSCALL_INSN_MASK: u64 = 0xffff;

/// What to observe while control is inside the traced function.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    /// Report each invocation's return value.
    CallCount,
    /// Single-step through the function body and report failing syscalls.
    Syscalls,
}

/// A system call that returned a negative result while control was inside
/// the traced function.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyscallFailure {
    /// Address of the `syscall` instruction.
    pub pc: u64,
    /// The negative result register value.
    pub result: i64,
}

/// One completed invocation of the traced function.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InvocationRecord {
    /// 1-based invocation index, in completion order.
    pub index: u64,
    /// The result register at the genuine return. `None` in syscall mode.
    pub return_value: Option<i64>,
    /// Failing syscalls observed inside this invocation, in program order.
    /// Always empty in call-count mode.
    pub syscall_failures: Vec<SyscallFailure>,
}

/// Receives invocation records as they complete. The CLI streams them to
/// stdout; tests collect them.
pub trait RecordSink {
    /// Called once per completed invocation, in completion order.
    fn invocation(&mut self, record: &InvocationRecord);
}

impl<F: FnMut(&InvocationRecord)> RecordSink for F {
    fn invocation(&mut self, record: &InvocationRecord) {
        self(record)
    }
}

/// Result of running the tracee until a SIGTRAP stop.
enum Stop {
    Trap(Stopped),
    Exited(ExitStatus),
}

/// How an in-function phase ended.
enum BodyOutcome {
    Returned {
        task: Stopped,
        value: i64,
        failures: Vec<SyscallFailure>,
    },
    Exited(ExitStatus),
}

/// Drives the wait/resume protocol that delimits invocations of a single
/// function.
///
/// One invocation is in flight at a time: the entry breakpoint is disarmed
/// while control is inside the function and re-armed after the genuine
/// return, so recursive re-entries are part of the enclosing invocation.
/// The genuine return is recognized by the stack pointer coming back to the
/// entry-time depth plus one return-address width; hitting the same return
/// address at any other depth re-arms the trap and keeps going.
pub struct InvocationTracker {
    target: ResolvedTarget,
    mode: Mode,
    invocations: u64,
}

impl InvocationTracker {
    /// Creates a tracker for `target`, observing per `mode`.
    pub fn new(target: ResolvedTarget, mode: Mode) -> Self {
        InvocationTracker {
            target,
            mode,
            invocations: 0,
        }
    }

    /// Runs the session to completion: waits for the freshly spawned
    /// tracee's initial stop, then loops over invocations until the tracee
    /// exits. Records are delivered to `sink` as they complete; zero
    /// records is a valid outcome.
    pub fn run(mut self, child: Running, sink: &mut dyn RecordSink) -> Result<ExitStatus, Error> {
        // The post-execve trap.
        let mut task = match child.wait()? {
            Wait::Stopped(task, _) => task,
            Wait::Exited(_, status) => return Ok(status),
        };

        loop {
            // Arm the entry breakpoint. For a PLT target the indirection
            // slot is re-read every time: lazy binding may have moved the
            // underlying code address since the last invocation.
            let entry = self.entry_addr(&task)?;
            let mut entry_bp = Breakpoint::new(entry);
            entry_bp.install(&mut task)?;

            // Run until our entry trap fires (or the tracee exits).
            let mut regs;
            loop {
                task = match resume_until_trap(task)? {
                    Stop::Exited(status) => return Ok(status),
                    Stop::Trap(task) => task,
                };
                regs = task.getregs()?;
                if regs.rip == entry + BREAKPOINT_LEN {
                    break;
                }
                tracing::debug!(rip = regs.rip, "stray trap while awaiting entry");
            }

            // Function entered: restore the entry bytes, rewind the pc and
            // capture this invocation's frame marker.
            entry_bp.remove(&mut task)?;
            regs.rip = entry;
            task.setregs(&regs)?;
            let frame = regs.rsp;
            let ret_addr = task.peek_word(frame)?;
            let mut ret_bp = Breakpoint::new(ret_addr);
            ret_bp.install(&mut task)?;
            tracing::debug!(entry, frame, ret_addr, "function entered");

            let outcome = match self.mode {
                Mode::CallCount => run_to_return(task, frame, &mut ret_bp)?,
                Mode::Syscalls => step_to_return(task, frame, &mut ret_bp)?,
            };

            task = match outcome {
                BodyOutcome::Exited(status) => return Ok(status),
                BodyOutcome::Returned {
                    task,
                    value,
                    failures,
                } => {
                    self.invocations += 1;
                    let record = InvocationRecord {
                        index: self.invocations,
                        return_value: match self.mode {
                            Mode::CallCount => Some(value),
                            Mode::Syscalls => None,
                        },
                        syscall_failures: failures,
                    };
                    tracing::debug!(index = record.index, "invocation completed");
                    sink.invocation(&record);
                    task
                }
            };
        }
    }

    /// The address to trap on next. For a PLT stub this dereferences the
    /// GOT slot's *current* contents.
    fn entry_addr(&self, task: &Stopped) -> Result<u64, Error> {
        match self.target {
            ResolvedTarget::Static(addr) => Ok(addr),
            ResolvedTarget::PltStub { got_slot } => task.peek_word(got_slot),
        }
    }
}

/// Call-count strategy: run freely until the return-site trap fires at the
/// entry-time stack depth.
fn run_to_return(
    mut task: Stopped,
    frame: u64,
    ret_bp: &mut Breakpoint,
) -> Result<BodyOutcome, Error> {
    loop {
        task = match resume_until_trap(task)? {
            Stop::Exited(status) => return Ok(BodyOutcome::Exited(status)),
            Stop::Trap(task) => task,
        };

        let mut regs = task.getregs()?;
        if regs.rip != ret_bp.addr() + BREAKPOINT_LEN {
            tracing::debug!(rip = regs.rip, "stray trap while awaiting return");
            continue;
        }

        ret_bp.remove(&mut task)?;
        regs.rip = ret_bp.addr();
        task.setregs(&regs)?;

        if regs.rsp == frame + RET_ADDR_LEN {
            // Restored to entry-time depth: the invocation has completed.
            return Ok(BodyOutcome::Returned {
                task,
                value: regs.rax as i64,
                failures: Vec::new(),
            });
        }

        // Same return address at a different depth: nested control flow
        // passing through without completing this invocation. Step over the
        // restored instruction, then re-arm.
        tracing::debug!(rsp = regs.rsp, frame, "return address hit at nested depth");
        task = match step_once(task)? {
            Stop::Exited(status) => return Ok(BodyOutcome::Exited(status)),
            Stop::Trap(task) => task,
        };
        ret_bp.install(&mut task)?;
    }
}

/// Syscall strategy: single-step every instruction inside the function,
/// reading the result register after each `syscall` instruction, until the
/// stack pointer unwinds past the frame marker or the return trap fires.
fn step_to_return(
    mut task: Stopped,
    frame: u64,
    ret_bp: &mut Breakpoint,
) -> Result<BodyOutcome, Error> {
    let mut failures = Vec::new();

    loop {
        let mut regs = task.getregs()?;

        if ret_bp.is_installed() && regs.rip == ret_bp.addr() + BREAKPOINT_LEN {
            // Stepped onto our own trap at the return site while still
            // nested. Restore and fall through to re-classify from the
            // rewound pc; the trap is re-armed after the next step.
            ret_bp.remove(&mut task)?;
            regs.rip = ret_bp.addr();
            task.setregs(&regs)?;
            tracing::debug!(rsp = regs.rsp, frame, "return address hit at nested depth");
            continue;
        }

        if regs.rsp == frame + RET_ADDR_LEN {
            // The function has genuinely returned.
            ret_bp.remove(&mut task)?;
            return Ok(BodyOutcome::Returned {
                task,
                value: regs.rax as i64,
                failures,
            });
        }

        let insn = task.peek_word(regs.rip)?;
        let syscall_site = (insn & SYSCALL_INSN_MASK == SYSCALL_INSN).then_some(regs.rip);

        task = match step_once(task)? {
            Stop::Exited(status) => return Ok(BodyOutcome::Exited(status)),
            Stop::Trap(task) => task,
        };
        ret_bp.install(&mut task)?;

        if let Some(pc) = syscall_site {
            let result = task.getregs()?.rax as i64;
            if result < 0 {
                tracing::debug!(pc, result, "failing syscall observed");
                failures.push(SyscallFailure { pc, result });
            }
        }
    }
}

/// Resumes the tracee and waits for the next SIGTRAP, passing every other
/// signal through to the tracee.
fn resume_until_trap(task: Stopped) -> Result<Stop, Error> {
    let mut running = task.resume(None)?;
    loop {
        match running.wait()? {
            Wait::Exited(_, status) => return Ok(Stop::Exited(status)),
            Wait::Stopped(task, Signal::SIGTRAP) => return Ok(Stop::Trap(task)),
            Wait::Stopped(task, sig) => running = task.resume(sig)?,
        }
    }
}

/// Executes one instruction, passing non-trap signals through while
/// continuing to step.
fn step_once(task: Stopped) -> Result<Stop, Error> {
    let mut running = task.step(None)?;
    loop {
        match running.wait()? {
            Wait::Exited(_, status) => return Ok(Stop::Exited(status)),
            Wait::Stopped(task, Signal::SIGTRAP) => return Ok(Stop::Trap(task)),
            Wait::Stopped(task, sig) => running = task.step(sig)?,
        }
    }
}
