/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

//! End-to-end tests driving the compiled binary against synthetic
//! executables.

use std::path::Path;
use std::process::Command;
use std::process::Output;

use fntrace_elf::testing::write_executable;
use fntrace_elf::testing::ElfBuilder;

const CODE: u64 = ElfBuilder::CODE_VADDR;

fn run_fntrace(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fntrace"))
        .args(args)
        .output()
        .unwrap()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn write_file(path: &Path, bytes: &[u8]) {
    write_executable(path, bytes).unwrap();
}

#[test]
fn rejects_files_that_are_not_elf_executables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    write_file(&path, b"just some text, not a program\n");

    let output = run_fntrace(&["main", path.to_str().unwrap()]);

    assert!(!output.status.success());
    assert_eq!(
        stdout_of(&output).trim_end(),
        format!("{} not an executable", path.display())
    );
}

#[test]
fn reports_missing_symbols_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target");
    let image = ElfBuilder::new()
        .code(&[0xc3])
        .entry(CODE)
        .global_func("main", CODE)
        .build();
    write_file(&path, &image);

    let output = run_fntrace(&["ghost", path.to_str().unwrap()]);

    assert!(!output.status.success());
    assert_eq!(stdout_of(&output).trim_end(), "ghost not found!");
}

#[test]
fn reports_local_symbols_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target");
    let image = ElfBuilder::new()
        .code(&[0xc3])
        .entry(CODE)
        .local_func("helper", CODE)
        .build();
    write_file(&path, &image);

    let output = run_fntrace(&["helper", path.to_str().unwrap()]);

    assert!(!output.status.success());
    assert_eq!(
        stdout_of(&output).trim_end(),
        "helper is not a global symbol!"
    );
}

#[test]
fn traces_a_single_invocation_end_to_end() {
    // add(rdi, rsi) followed by exit(0).
    let mut code = Vec::new();
    // add: lea eax, [rdi + rsi]; ret
    code.extend_from_slice(&[0x8d, 0x04, 0x37, 0xc3]);
    // _start: mov edi, 2; mov esi, 3; call add
    code.extend_from_slice(&[0xbf, 0x02, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&[0xbe, 0x03, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&[0xe8, 0xed, 0xff, 0xff, 0xff]);
    // mov edi, 0; mov eax, 60; syscall
    code.extend_from_slice(&[0xbf, 0x00, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&[0xb8, 0x3c, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&[0x0f, 0x05]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target");
    let image = ElfBuilder::new()
        .code(&code)
        .entry(CODE + 4)
        .global_func("add", CODE)
        .global_func("_start", CODE + 4)
        .build();
    write_file(&path, &image);

    let output = run_fntrace(&["add", path.to_str().unwrap()]);

    assert!(output.status.success(), "stderr: {:?}", output.stderr);
    assert_eq!(stdout_of(&output).trim_end(), "run #1 returned with 5");
}
