/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io;
use std::path::Path;

use thiserror::Error;

pub(crate) const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub(crate) const ELFCLASS64: u8 = 2;
pub(crate) const ET_EXEC: u16 = 2;

pub(crate) const SHT_SYMTAB: u32 = 2;
pub(crate) const SHT_STRTAB: u32 = 3;
pub(crate) const SHT_RELA: u32 = 4;

/// Sentinel section index for symbols the file itself does not define.
pub const SHN_UNDEF: u16 = 0;

const EI_CLASS: usize = 4;
const EHDR_LEN: usize = 64;
const SHDR_LEN: usize = 64;

/// An error produced while reading or navigating the ELF image.
#[derive(Error, Debug)]
pub enum ElfError {
    /// The file could not be opened or read.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The file is not a 64-bit ELF executable. Shared objects and
    /// relocatable objects are rejected here as well.
    #[error("not an executable")]
    NotAnExecutable,

    /// A structure declared by the header extends past the end of the file.
    #[error("structure at offset {0:#x} (length {1:#x}) extends past the end of the file")]
    Truncated(usize, usize),

    /// A section header references another section that does not exist.
    #[error("section link {0} is out of range")]
    BadLink(usize),
}

/// One parsed entry of the section header table.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    /// Offset of the section's name in the section-header string table.
    pub name: u32,
    /// Section type (`sh_type`).
    pub kind: u32,
    /// Section flags.
    pub flags: u64,
    /// Virtual address of the section in the running image, 0 if unloaded.
    pub addr: u64,
    /// Offset of the section's contents in the file.
    pub offset: u64,
    /// Size of the section's contents in bytes.
    pub size: u64,
    /// Index of an associated section. For a symbol table this is its
    /// string table; this is how symbol strings are told apart from the
    /// other string-table-typed sections in the file.
    pub link: u32,
    /// Extra section-specific information.
    pub info: u32,
    /// Size of one entry for table-shaped sections, 0 otherwise.
    pub entsize: u64,
}

impl SectionHeader {
    /// Number of fixed-size entries in the section.
    pub fn entry_count(&self) -> usize {
        if self.entsize == 0 {
            0
        } else {
            (self.size / self.entsize) as usize
        }
    }
}

/// The section categories the resolver asks for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SectionKind {
    /// The full symbol table (`.symtab`).
    SymbolTable,
    /// The relocations backing lazily-bound PLT calls (`.rela.plt`). The
    /// loaded data relocation section shares the same type code and must not
    /// match this.
    PltRelocations,
}

/// A read-only parsed view of an ELF64 executable.
///
/// The whole file is held in an owned buffer; section contents are handed
/// out as borrowed slices after validating the declared offsets against the
/// buffer's real length. The image is immutable once constructed.
#[derive(Debug)]
pub struct ElfImage {
    bytes: Vec<u8>,
    entry: u64,
    sections: Vec<SectionHeader>,
    shstrndx: usize,
}

impl ElfImage {
    /// Reads and parses the executable at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ElfError> {
        Self::parse(std::fs::read(path)?)
    }

    /// Parses an image already held in memory.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ElfError> {
        if bytes.len() < EHDR_LEN
            || bytes[..4] != ELF_MAGIC
            || bytes[EI_CLASS] != ELFCLASS64
            || read_u16(&bytes, 16)? != ET_EXEC
        {
            return Err(ElfError::NotAnExecutable);
        }

        let entry = read_u64(&bytes, 24)?;
        let shoff = read_u64(&bytes, 40)? as usize;
        let shentsize = read_u16(&bytes, 58)? as usize;
        let shnum = read_u16(&bytes, 60)? as usize;
        let shstrndx = read_u16(&bytes, 62)? as usize;

        if shnum > 0 && shentsize < SHDR_LEN {
            return Err(ElfError::NotAnExecutable);
        }

        let mut sections = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let base = shoff
                .checked_add(i * shentsize)
                .ok_or(ElfError::Truncated(shoff, i * shentsize))?;
            sections.push(SectionHeader {
                name: read_u32(&bytes, base)?,
                kind: read_u32(&bytes, base + 4)?,
                flags: read_u64(&bytes, base + 8)?,
                addr: read_u64(&bytes, base + 16)?,
                offset: read_u64(&bytes, base + 24)?,
                size: read_u64(&bytes, base + 32)?,
                link: read_u32(&bytes, base + 40)?,
                info: read_u32(&bytes, base + 44)?,
                entsize: read_u64(&bytes, base + 56)?,
            });
        }

        if shnum > 0 && shstrndx >= shnum {
            return Err(ElfError::BadLink(shstrndx));
        }

        Ok(ElfImage {
            bytes,
            entry,
            sections,
            shstrndx,
        })
    }

    /// The program entry point declared by the header.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// The parsed section header table.
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// Number of sections in the file.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Returns the first section matching `kind`, or `None` if the file has
    /// no such section.
    pub fn section(&self, kind: SectionKind) -> Option<&SectionHeader> {
        match kind {
            SectionKind::SymbolTable => self.sections.iter().find(|s| s.kind == SHT_SYMTAB),
            SectionKind::PltRelocations => self.sections.iter().find(|s| {
                s.kind == SHT_RELA && self.section_name(s).is_some_and(|n| n == ".rela.plt")
            }),
        }
    }

    /// The section a symbol-table section's `link` field points at, which by
    /// the format's rules is that table's string table.
    pub fn linked_section(&self, section: &SectionHeader) -> Result<&SectionHeader, ElfError> {
        let link = section.link as usize;
        self.sections.get(link).ok_or(ElfError::BadLink(link))
    }

    /// Borrows the contents of `section`, validating the declared range
    /// against the file's real size.
    pub fn section_data(&self, section: &SectionHeader) -> Result<&[u8], ElfError> {
        let offset = section.offset as usize;
        let size = section.size as usize;
        let end = offset
            .checked_add(size)
            .ok_or(ElfError::Truncated(offset, size))?;
        self.bytes
            .get(offset..end)
            .ok_or(ElfError::Truncated(offset, size))
    }

    /// The section's name from the section-header string table. `None` if
    /// the name offset is out of range or unterminated.
    pub fn section_name(&self, section: &SectionHeader) -> Option<&str> {
        let strings = self.sections.get(self.shstrndx)?;
        if strings.kind != SHT_STRTAB {
            return None;
        }
        let data = self.section_data(strings).ok()?;
        str_at(data, section.name as usize)
    }

    /// Reads the NUL-terminated string at `offset` inside `strings`.
    pub(crate) fn string_at(
        &self,
        strings: &SectionHeader,
        offset: usize,
    ) -> Result<Option<&str>, ElfError> {
        Ok(str_at(self.section_data(strings)?, offset))
    }
}

/// Extracts the NUL-terminated string starting at `offset`, if there is one.
fn str_at(data: &[u8], offset: usize) -> Option<&str> {
    let tail = data.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..len]).ok()
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, ElfError> {
    Ok(u16::from_le_bytes(field(bytes, offset)?))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ElfError> {
    Ok(u32::from_le_bytes(field(bytes, offset)?))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, ElfError> {
    Ok(u64::from_le_bytes(field(bytes, offset)?))
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], ElfError> {
    let end = offset.checked_add(N).ok_or(ElfError::Truncated(offset, N))?;
    bytes
        .get(offset..end)
        .map(|s| {
            let mut out = [0u8; N];
            out.copy_from_slice(s);
            out
        })
        .ok_or(ElfError::Truncated(offset, N))
}

pub(crate) fn read_u8(bytes: &[u8], offset: usize) -> Result<u8, ElfError> {
    bytes
        .get(offset)
        .copied()
        .ok_or(ElfError::Truncated(offset, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;

    #[test]
    fn rejects_garbage() {
        let err = ElfImage::parse(b"not an elf file at all".to_vec()).unwrap_err();
        assert!(matches!(err, ElfError::NotAnExecutable));
    }

    #[test]
    fn rejects_shared_objects() {
        // ET_DYN in place of ET_EXEC.
        let bytes = ElfBuilder::new().object_type(3).build();
        let err = ElfImage::parse(bytes).unwrap_err();
        assert!(matches!(err, ElfError::NotAnExecutable));
    }

    #[test]
    fn rejects_truncated_section_table() {
        let mut bytes = ElfBuilder::new()
            .code(&[0xc3])
            .global_func("f", ElfBuilder::CODE_VADDR)
            .build();
        // Chop the file in the middle of the section header table.
        bytes.truncate(bytes.len() - 7);
        let err = ElfImage::parse(bytes).unwrap_err();
        assert!(matches!(err, ElfError::Truncated(..)));
    }

    #[test]
    fn finds_symbol_table_and_linked_strings() {
        let bytes = ElfBuilder::new()
            .code(&[0xc3])
            .global_func("f", ElfBuilder::CODE_VADDR)
            .build();
        let image = ElfImage::parse(bytes).unwrap();

        let symtab = image.section(SectionKind::SymbolTable).unwrap();
        assert_eq!(symtab.entsize, 24);
        assert!(symtab.entry_count() >= 2); // the null entry plus "f"

        let strtab = image.linked_section(symtab).unwrap();
        assert_eq!(strtab.kind, SHT_STRTAB);
        let data = image.section_data(strtab).unwrap();
        assert!(data.windows(2).any(|w| w == b"f\0"));
    }

    #[test]
    fn plt_relocations_require_the_plt_name() {
        // A .rela section that is not .rela.plt must not satisfy the lookup.
        let bytes = ElfBuilder::new().code(&[0xc3]).build();
        let image = ElfImage::parse(bytes).unwrap();
        assert!(image.section(SectionKind::PltRelocations).is_none());

        let bytes = ElfBuilder::new()
            .code(&[0xc3])
            .undef_func("ext")
            .plt_rela(0x601000, 1)
            .build();
        let image = ElfImage::parse(bytes).unwrap();
        let rela = image.section(SectionKind::PltRelocations).unwrap();
        assert_eq!(image.section_name(rela), Some(".rela.plt"));
        assert_eq!(rela.entry_count(), 1);
    }

    #[test]
    fn entry_point_round_trips() {
        let bytes = ElfBuilder::new()
            .code(&[0xc3])
            .entry(ElfBuilder::CODE_VADDR)
            .build();
        let image = ElfImage::parse(bytes).unwrap();
        assert_eq!(image.entry(), ElfBuilder::CODE_VADDR);
    }
}
