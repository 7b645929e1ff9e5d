/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use nix::sys::ptrace;

use crate::Error;
use crate::Stopped;

/// Word-granular access to a tracee's text (and data) memory.
///
/// The breakpoint engine is written against this trait instead of
/// [`Stopped`] directly so that its save/patch/restore arithmetic can be
/// exercised against plain fake memory in tests.
pub trait TextMemory {
    /// Reads the word at `addr`.
    fn peek_word(&self, addr: u64) -> Result<u64, Error>;

    /// Writes the word at `addr`.
    fn poke_word(&mut self, addr: u64, word: u64) -> Result<(), Error>;
}

impl TextMemory for Stopped {
    fn peek_word(&self, addr: u64) -> Result<u64, Error> {
        ptrace::read(self.pid(), addr as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|err| self.map_nix_err(err))
    }

    fn poke_word(&mut self, addr: u64, word: u64) -> Result<(), Error> {
        ptrace::write(self.pid(), addr as ptrace::AddressType, word as i64)
            .map_err(|err| self.map_nix_err(err))
    }
}
