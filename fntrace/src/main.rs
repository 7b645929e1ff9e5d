/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thin CLI front end: parses arguments, picks the observation mode, and
//! feeds the resolver's output and the spawned tracee to the tracker.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fntrace_elf::resolve;
use fntrace_elf::ElfError;
use fntrace_elf::ElfImage;
use fntrace_elf::ResolveError;
use fntrace_elf::ResolvedTarget;
use fntrace_ptrace::spawn;
use fntrace_ptrace::ExitStatus;
use fntrace_ptrace::InvocationRecord;
use fntrace_ptrace::InvocationTracker;
use fntrace_ptrace::Mode;
use fntrace_ptrace::RecordSink;
use tracing_subscriber::EnvFilter;

/// Trace every invocation of one function in an ELF64 executable.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Report the failing system calls issued inside the function instead
    /// of per-invocation return values.
    #[arg(long)]
    syscalls: bool,

    /// Name of the function to trace.
    #[arg(value_name = "FUNCTION")]
    function: String,

    /// Path of the program to trace.
    #[arg(value_name = "PROGRAM")]
    program: PathBuf,

    /// Arguments to the program to trace.
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

/// Streams records to stdout in the wire format of each mode.
struct PrintSink;

impl RecordSink for PrintSink {
    fn invocation(&mut self, record: &InvocationRecord) {
        if let Some(value) = record.return_value {
            println!("run #{} returned with {}", record.index, value);
        }
        for failure in &record.syscall_failures {
            println!(
                "syscall in {:#x} returned with {}",
                failure.pc, failure.result
            );
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let image = match ElfImage::open(&args.program) {
        Ok(image) => image,
        Err(ElfError::NotAnExecutable) => {
            println!("{} not an executable", args.program.display());
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("fntrace: {}: {}", args.program.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let target = match resolve(&image, &args.function) {
        Ok(target) => target,
        Err(err @ (ResolveError::NotFound(_) | ResolveError::NotGlobal(_))) => {
            println!("{}", err);
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("fntrace: {}", err);
            return ExitCode::FAILURE;
        }
    };
    // The resolved address (or slot) is all that survives past this point.
    drop(image);

    match trace_session(target, &args) {
        Ok(status) => {
            tracing::debug!(%status, "trace session completed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("fntrace: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn trace_session(target: ResolvedTarget, args: &Args) -> anyhow::Result<ExitStatus> {
    let mode = if args.syscalls {
        Mode::Syscalls
    } else {
        Mode::CallCount
    };

    let child = spawn(args.program.as_os_str(), &args.args)
        .with_context(|| format!("failed to launch {}", args.program.display()))?;

    InvocationTracker::new(target, mode)
        .run(child, &mut PrintSink)
        .context("trace session failed")
}
