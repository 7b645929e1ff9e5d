/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use crate::Error;
use crate::TextMemory;

/// Width of the trap instruction, and therefore how far the program counter
/// must be rewound after a breakpoint fires.
pub const BREAKPOINT_LEN: u64 = 1;

const TRAP_OPCODE: u64 = 0xcc; // int3
const SAVED_MASK: u64 = !0xff;

/// A single-byte trap planted in tracee code.
///
/// `install` preserves the aligned word it overwrites so that `remove` can
/// restore memory bit-identically. Installing twice at the same address
/// without an intervening remove would overwrite the saved word with the
/// trap byte, so the pair below refuses to re-install while armed.
#[derive(Debug)]
pub struct Breakpoint {
    addr: u64,
    saved: u64,
    installed: bool,
}

impl Breakpoint {
    /// Creates an unarmed breakpoint at `addr`.
    pub fn new(addr: u64) -> Self {
        Breakpoint {
            addr,
            saved: 0,
            installed: false,
        }
    }

    /// The address the trap is (or will be) planted at.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Whether the trap byte is currently present in tracee memory.
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Saves the word at the target address and replaces its lowest byte
    /// with the trap opcode. A no-op if already installed.
    pub fn install<M: TextMemory>(&mut self, mem: &mut M) -> Result<(), Error> {
        if self.installed {
            return Ok(());
        }
        let word = mem.peek_word(self.addr)?;
        mem.poke_word(self.addr, (word & SAVED_MASK) | TRAP_OPCODE)?;
        self.saved = word;
        self.installed = true;
        Ok(())
    }

    /// Writes the saved word back verbatim. A no-op if not installed.
    pub fn remove<M: TextMemory>(&mut self, mem: &mut M) -> Result<(), Error> {
        if !self.installed {
            return Ok(());
        }
        mem.poke_word(self.addr, self.saved)?;
        self.installed = false;
        Ok(())
    }
}
