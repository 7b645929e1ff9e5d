/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(rustdoc::broken_intra_doc_links)]

//! A read-only view of an ELF64 executable, just deep enough to find a
//! callable address for a named function.
//!
//! This crate deliberately does not pull in a general-purpose object-file
//! parser. The tracer needs exactly three things from the file: the section
//! header table, the symbol table with its linked string table, and the PLT
//! relocation table. All of it is read through bounds-checked accessors over
//! an owned byte buffer, so a malformed file produces an error instead of an
//! out-of-bounds read.

mod image;
mod symbols;
pub mod testing;

pub use crate::image::ElfError;
pub use crate::image::ElfImage;
pub use crate::image::SectionHeader;
pub use crate::image::SectionKind;
pub use crate::symbols::resolve;
pub use crate::symbols::Binding;
pub use crate::symbols::ResolveError;
pub use crate::symbols::ResolvedTarget;
