/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use thiserror::Error;

use crate::image::read_u16;
use crate::image::read_u32;
use crate::image::read_u64;
use crate::image::read_u8;
use crate::image::ElfError;
use crate::image::ElfImage;
use crate::image::SectionKind;
use crate::image::SHN_UNDEF;

const SYM_ENTRY_LEN: u64 = 24;
const RELA_ENTRY_LEN: u64 = 24;

/// Symbol binding, from the high nibble of `st_info`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Binding {
    /// Not visible outside the object file.
    Local,
    /// Visible to all objects being combined.
    Global,
    /// Like global, but with lower precedence.
    Weak,
    /// Anything else (OS- or processor-specific).
    Other(u8),
}

impl From<u8> for Binding {
    fn from(st_info: u8) -> Self {
        match st_info >> 4 {
            0 => Binding::Local,
            1 => Binding::Global,
            2 => Binding::Weak,
            other => Binding::Other(other),
        }
    }
}

/// Where the requested function can be reached.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResolvedTarget {
    /// The function's code is present in the file at this address.
    Static(u64),
    /// The function is satisfied by the dynamic linker. `got_slot` is the
    /// address of the indirection slot the PLT stub jumps through; its
    /// contents may change after the first call due to lazy binding.
    PltStub {
        /// Address of the GOT entry for this function.
        got_slot: u64,
    },
}

/// Why a name could not be turned into a [`ResolvedTarget`].
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No symbol table entry has this name.
    #[error("{0} not found!")]
    NotFound(String),

    /// The first entry with this name is not globally bound.
    #[error("{0} is not a global symbol!")]
    NotGlobal(String),

    /// The symbol is undefined but no PLT relocation references it, so there
    /// is no indirection slot to watch.
    #[error("{0} has no PLT relocation entry")]
    UnresolvedDynamic(String),

    /// The image itself is malformed.
    #[error(transparent)]
    Elf(#[from] ElfError),
}

/// Resolves `name` against the image's symbol table.
///
/// The scan runs in file order and the *first* entry whose name matches
/// governs classification, even if a later entry with the same name would
/// classify differently. A defined global symbol resolves to its value; an
/// undefined global symbol is matched against the PLT relocation table by
/// its dynamic ordinal, reconstructed as the 1-based position of the entry
/// among named undefined entries (the unnamed null symbol at index 0 does
/// not count, matching the convention that dynamic symbol 0 is reserved).
pub fn resolve(image: &ElfImage, name: &str) -> Result<ResolvedTarget, ResolveError> {
    let symtab = match image.section(SectionKind::SymbolTable) {
        Some(s) => s,
        None => return Err(ResolveError::NotFound(name.to_owned())),
    };
    let strtab = *image.linked_section(symtab)?;
    let data = image.section_data(symtab)?;

    let entsize = symtab.entsize.max(SYM_ENTRY_LEN);
    let count = symtab.size / entsize;

    let mut undefined_seen: u64 = 0;
    for i in 0..count {
        let base = (i * entsize) as usize;
        let st_name = read_u32(data, base)? as usize;
        let st_info = read_u8(data, base + 4)?;
        let st_shndx = read_u16(data, base + 6)?;
        let st_value = read_u64(data, base + 8)?;

        let sym_name = image.string_at(&strtab, st_name)?.unwrap_or("");
        if st_shndx == SHN_UNDEF && !sym_name.is_empty() {
            undefined_seen += 1;
        }

        if sym_name != name {
            continue;
        }

        if Binding::from(st_info) != Binding::Global {
            return Err(ResolveError::NotGlobal(name.to_owned()));
        }

        if st_shndx != SHN_UNDEF {
            return Ok(ResolvedTarget::Static(st_value));
        }

        return match find_plt_slot(image, undefined_seen)? {
            Some(got_slot) => Ok(ResolvedTarget::PltStub { got_slot }),
            None => Err(ResolveError::UnresolvedDynamic(name.to_owned())),
        };
    }

    Err(ResolveError::NotFound(name.to_owned()))
}

/// Scans the PLT relocation table for the entry whose embedded symbol
/// reference equals `ordinal` and returns its slot address.
fn find_plt_slot(image: &ElfImage, ordinal: u64) -> Result<Option<u64>, ElfError> {
    let rela = match image.section(SectionKind::PltRelocations) {
        Some(s) => s,
        None => return Ok(None),
    };
    let data = image.section_data(rela)?;
    let entsize = rela.entsize.max(RELA_ENTRY_LEN);
    let count = rela.size / entsize;

    for i in 0..count {
        let base = (i * entsize) as usize;
        let r_offset = read_u64(data, base)?;
        let r_info = read_u64(data, base + 8)?;
        if r_info >> 32 == ordinal {
            return Ok(Some(r_offset));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;

    const CODE: u64 = ElfBuilder::CODE_VADDR;

    fn image(builder: ElfBuilder) -> ElfImage {
        ElfImage::parse(builder.build()).unwrap()
    }

    #[test]
    fn static_global_symbol() {
        let image = image(
            ElfBuilder::new()
                .code(&[0xc3, 0xc3])
                .global_func("add", CODE + 1),
        );
        let target = resolve(&image, "add").unwrap();
        assert_eq!(target, ResolvedTarget::Static(CODE + 1));
    }

    #[test]
    fn missing_symbol() {
        let image = image(ElfBuilder::new().code(&[0xc3]).global_func("add", CODE));
        let err = resolve(&image, "ghost").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(name) if name == "ghost"));
    }

    #[test]
    fn local_symbol_is_rejected() {
        let image = image(ElfBuilder::new().code(&[0xc3]).local_func("helper", CODE));
        let err = resolve(&image, "helper").unwrap_err();
        assert!(matches!(err, ResolveError::NotGlobal(name) if name == "helper"));
    }

    #[test]
    fn first_match_governs_even_if_shadowed_by_a_global() {
        // A local entry followed by a global entry of the same name: the
        // local one is seen first and wins.
        let image = image(
            ElfBuilder::new()
                .code(&[0xc3, 0xc3])
                .local_func("dup", CODE)
                .global_func("dup", CODE + 1),
        );
        let err = resolve(&image, "dup").unwrap_err();
        assert!(matches!(err, ResolveError::NotGlobal(_)));
    }

    #[test]
    fn weak_binding_is_not_global() {
        let image = image(ElfBuilder::new().code(&[0xc3]).weak_func("w", CODE));
        assert!(matches!(
            resolve(&image, "w").unwrap_err(),
            ResolveError::NotGlobal(_)
        ));
    }

    #[test]
    fn undefined_symbol_maps_to_its_plt_slot() {
        let image = image(
            ElfBuilder::new()
                .code(&[0xc3])
                .undef_func("printf")
                .undef_func("malloc")
                .plt_rela(0x601018, 1)
                .plt_rela(0x601020, 2),
        );
        assert_eq!(
            resolve(&image, "printf").unwrap(),
            ResolvedTarget::PltStub { got_slot: 0x601018 }
        );
        assert_eq!(
            resolve(&image, "malloc").unwrap(),
            ResolvedTarget::PltStub { got_slot: 0x601020 }
        );
    }

    #[test]
    fn defined_symbols_do_not_shift_dynamic_ordinals() {
        // A defined global between two undefined entries must not count
        // toward the undefined ordinal.
        let image = image(
            ElfBuilder::new()
                .code(&[0xc3])
                .undef_func("first")
                .global_func("mine", CODE)
                .undef_func("second")
                .plt_rela(0x601018, 1)
                .plt_rela(0x601020, 2),
        );
        assert_eq!(
            resolve(&image, "second").unwrap(),
            ResolvedTarget::PltStub { got_slot: 0x601020 }
        );
    }

    #[test]
    fn undefined_symbol_without_relocation() {
        let image = image(ElfBuilder::new().code(&[0xc3]).undef_func("orphan"));
        assert!(matches!(
            resolve(&image, "orphan").unwrap_err(),
            ResolveError::UnresolvedDynamic(_)
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let bytes = ElfBuilder::new()
            .code(&[0xc3])
            .global_func("f", CODE)
            .undef_func("g")
            .plt_rela(0x601018, 1)
            .build();
        let image = ElfImage::parse(bytes).unwrap();
        for _ in 0..3 {
            assert_eq!(resolve(&image, "f").unwrap(), ResolvedTarget::Static(CODE));
            assert_eq!(
                resolve(&image, "g").unwrap(),
                ResolvedTarget::PltStub { got_slot: 0x601018 }
            );
        }
    }
}
