/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test support: builds small ELF64 executables from scratch.
//!
//! The builder emits a complete, loadable static executable: ELF header, one
//! RWX `PT_LOAD` segment covering the supplied code bytes, and a section
//! header table with `.text`, `.symtab`, `.strtab`, `.shstrtab` and
//! (optionally) `.rela.plt`. Unit tests feed the result straight to
//! [`ElfImage::parse`](crate::ElfImage::parse); integration tests write it
//! to disk, mark it executable and actually trace it.

use std::io;
use std::path::Path;

/// One symbol table entry queued by the builder.
struct Sym {
    name: String,
    value: u64,
    info: u8,
    shndx: u16,
}

/// Builder for a minimal ELF64 executable image.
pub struct ElfBuilder {
    e_type: u16,
    entry: u64,
    code: Vec<u8>,
    symbols: Vec<Sym>,
    relas: Vec<(u64, u64)>, // (slot address, dynamic ordinal)
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfBuilder {
    /// Load address of the image.
    pub const BASE_VADDR: u64 = 0x40_0000;
    /// Virtual address of the first code byte.
    pub const CODE_VADDR: u64 = Self::BASE_VADDR + Self::CODE_OFFSET;

    const CODE_OFFSET: u64 = 0x1000;

    const STB_LOCAL: u8 = 0;
    const STB_GLOBAL: u8 = 1;
    const STB_WEAK: u8 = 2;
    const STT_FUNC: u8 = 2;
    const R_X86_64_JUMP_SLOT: u64 = 7;

    pub fn new() -> Self {
        ElfBuilder {
            e_type: 2, // ET_EXEC
            entry: Self::CODE_VADDR,
            code: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
        }
    }

    /// Overrides `e_type` (to model shared or relocatable objects).
    pub fn object_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    /// Sets the loaded bytes of the image, mapped at [`Self::CODE_VADDR`].
    pub fn code(mut self, bytes: &[u8]) -> Self {
        self.code = bytes.to_vec();
        self
    }

    /// Sets the entry point. Defaults to [`Self::CODE_VADDR`].
    pub fn entry(mut self, addr: u64) -> Self {
        self.entry = addr;
        self
    }

    pub fn global_func(self, name: &str, addr: u64) -> Self {
        self.func(name, addr, Self::STB_GLOBAL, 1)
    }

    pub fn local_func(self, name: &str, addr: u64) -> Self {
        self.func(name, addr, Self::STB_LOCAL, 1)
    }

    pub fn weak_func(self, name: &str, addr: u64) -> Self {
        self.func(name, addr, Self::STB_WEAK, 1)
    }

    /// Adds an undefined (dynamically satisfied) function symbol.
    pub fn undef_func(self, name: &str) -> Self {
        self.func(name, 0, Self::STB_GLOBAL, 0)
    }

    fn func(mut self, name: &str, value: u64, bind: u8, shndx: u16) -> Self {
        self.symbols.push(Sym {
            name: name.to_owned(),
            value,
            info: (bind << 4) | Self::STT_FUNC,
            shndx,
        });
        self
    }

    /// Adds a `.rela.plt` entry binding `ordinal` to the GOT slot at
    /// `slot_addr`.
    pub fn plt_rela(mut self, slot_addr: u64, ordinal: u64) -> Self {
        self.relas.push((slot_addr, ordinal));
        self
    }

    /// Serializes the executable.
    pub fn build(self) -> Vec<u8> {
        let has_rela = !self.relas.is_empty();

        // String tables.
        let mut strtab = vec![0u8];
        let name_offsets: Vec<u32> = self
            .symbols
            .iter()
            .map(|sym| {
                let off = strtab.len() as u32;
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
                off
            })
            .collect();

        let mut shstrtab = vec![0u8];
        let mut shname = |name: &str| -> u32 {
            let off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            off
        };
        let n_text = shname(".text");
        let n_symtab = shname(".symtab");
        let n_strtab = shname(".strtab");
        let n_shstrtab = shname(".shstrtab");
        let n_rela = if has_rela { shname(".rela.plt") } else { 0 };

        // Symbol table, led by the mandatory null entry.
        let mut symtab = vec![0u8; 24];
        for (sym, name_off) in self.symbols.iter().zip(&name_offsets) {
            push_u32(&mut symtab, *name_off);
            symtab.push(sym.info);
            symtab.push(0); // st_other
            push_u16(&mut symtab, sym.shndx);
            push_u64(&mut symtab, sym.value);
            push_u64(&mut symtab, 0); // st_size
        }

        let mut rela = Vec::new();
        for (slot, ordinal) in &self.relas {
            push_u64(&mut rela, *slot);
            push_u64(&mut rela, (ordinal << 32) | Self::R_X86_64_JUMP_SLOT);
            push_u64(&mut rela, 0); // r_addend
        }

        // File layout: headers, padding, code, then unloaded tables.
        let mut out = vec![0u8; Self::CODE_OFFSET as usize];
        out.extend_from_slice(&self.code);

        let symtab_off = out.len();
        out.extend_from_slice(&symtab);
        let strtab_off = out.len();
        out.extend_from_slice(&strtab);
        let shstrtab_off = out.len();
        out.extend_from_slice(&shstrtab);
        let rela_off = out.len();
        out.extend_from_slice(&rela);

        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len();

        // Section headers: null, .text, .symtab, .strtab, .shstrtab
        // and optionally .rela.plt.
        let shnum: u16 = if has_rela { 6 } else { 5 };
        push_shdr(&mut out, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        push_shdr(
            &mut out,
            n_text,
            1, // SHT_PROGBITS
            0x6, // ALLOC | EXECINSTR
            Self::CODE_VADDR,
            Self::CODE_OFFSET,
            self.code.len() as u64,
            0,
            0,
            0,
        );
        push_shdr(
            &mut out,
            n_symtab,
            2, // SHT_SYMTAB
            0,
            0,
            symtab_off as u64,
            symtab.len() as u64,
            3, // link: .strtab
            1, // info: first non-local symbol (unused here)
            24,
        );
        push_shdr(
            &mut out,
            n_strtab,
            3, // SHT_STRTAB
            0,
            0,
            strtab_off as u64,
            strtab.len() as u64,
            0,
            0,
            0,
        );
        push_shdr(
            &mut out,
            n_shstrtab,
            3, // SHT_STRTAB
            0,
            0,
            shstrtab_off as u64,
            shstrtab.len() as u64,
            0,
            0,
            0,
        );
        if has_rela {
            push_shdr(
                &mut out,
                n_rela,
                4,    // SHT_RELA
                0x42, // ALLOC | INFO_LINK
                0,
                rela_off as u64,
                rela.len() as u64,
                2, // link: .symtab
                1, // info: .text
                24,
            );
        }

        // ELF header.
        let ident = [
            0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        out[..16].copy_from_slice(&ident);
        write_u16(&mut out, 16, self.e_type);
        write_u16(&mut out, 18, 62); // EM_X86_64
        write_u32(&mut out, 20, 1); // EV_CURRENT
        write_u64(&mut out, 24, self.entry);
        write_u64(&mut out, 32, 64); // e_phoff
        write_u64(&mut out, 40, shoff as u64);
        write_u16(&mut out, 52, 64); // e_ehsize
        write_u16(&mut out, 54, 56); // e_phentsize
        write_u16(&mut out, 56, 1); // e_phnum
        write_u16(&mut out, 58, 64); // e_shentsize
        write_u16(&mut out, 60, shnum);
        write_u16(&mut out, 62, 4); // e_shstrndx

        // One RWX PT_LOAD segment covering headers and code. RWX so that
        // fixtures modeling lazy binding can rewrite their own slots.
        let filesz = Self::CODE_OFFSET + self.code.len() as u64;
        write_u32(&mut out, 64, 1); // PT_LOAD
        write_u32(&mut out, 68, 0x7); // RWE
        write_u64(&mut out, 72, 0); // p_offset
        write_u64(&mut out, 80, Self::BASE_VADDR);
        write_u64(&mut out, 88, Self::BASE_VADDR); // p_paddr
        write_u64(&mut out, 96, filesz);
        write_u64(&mut out, 104, filesz); // p_memsz
        write_u64(&mut out, 112, 0x1000); // p_align

        out
    }
}

/// Writes `bytes` to `path` and marks the file executable.
pub fn write_executable<P: AsRef<Path>>(path: P, bytes: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(&path, bytes)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn push_shdr(
    out: &mut Vec<u8>,
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    entsize: u64,
) {
    push_u32(out, name);
    push_u32(out, kind);
    push_u64(out, flags);
    push_u64(out, addr);
    push_u64(out, offset);
    push_u64(out, size);
    push_u32(out, link);
    push_u32(out, info);
    push_u64(out, 8); // sh_addralign
    push_u64(out, entsize);
}

fn write_u16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(out: &mut [u8], offset: usize, value: u64) {
    out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
