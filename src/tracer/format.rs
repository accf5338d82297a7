//! Rendering of trace lines.
//!
//! Every function returns one complete line, newline included, so the caller
//! can write it in a single call.

use super::ledger::LedgerEntry;
use crate::config::DisplayOptions;
use crate::events::ExitStatus;
use crate::prelude::*;
use crate::process::{Pid, ProcessTable};
use crate::quote::push_quoted;
use std::io::Write;
use std::time::Duration;

const INDENT: &[u8] = b"  ";

/// An exec line and the command label to remember for the process.
#[derive(Debug, PartialEq, Eq)]
pub struct RenderedExec {
    pub line: Vec<u8>,
    pub label: Vec<u8>,
}

/// `<pid>[marker] <indent>`
fn push_prefix(out: &mut Vec<u8>, pid: Pid, marker: Option<u8>, depth: u32, flat: bool) {
    // Writing into a Vec cannot fail
    let _ = write!(out, "{pid}");
    out.extend(marker);
    out.push(b' ');
    if !flat {
        for _ in 0..depth {
            out.extend_from_slice(INDENT);
        }
    }
}

/// Seconds with millisecond precision, e.g. `1.500s`.
pub fn format_elapsed(start: Duration, end: Duration) -> String {
    let elapsed = end.saturating_sub(start);
    format!("{}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis())
}

/// Short name of the command, the last path component of `argv[0]`.
pub fn command_label(argv0: &[u8]) -> &[u8] {
    match argv0.rsplit(|&b| b == b'/').next() {
        Some(name) if !name.is_empty() => name,
        _ => argv0,
    }
}

pub fn render_exec(
    pid: Pid,
    depth: u32,
    display: &DisplayOptions,
    procs: &impl ProcessTable,
) -> RenderedExec {
    let marker = display.show_exit.then_some(b'+');
    let mut line = Vec::with_capacity(256);
    push_prefix(&mut line, pid, marker, depth, display.flat);

    if display.show_cwd {
        match procs.cwd(pid) {
            Ok(cwd) => push_quoted(&mut line, &cwd),
            Err(_) => line.push(b'?'),
        }
        line.extend_from_slice(b" % ");
    }

    let argv = match procs.argv(pid) {
        Ok(argv) if !argv.is_empty() => argv,
        Ok(_) => {
            warn!("Process {pid} has an empty command line");
            return blank_exec(line);
        }
        Err(err) => {
            warn!("Failed to read the command line of process {pid}: {err:#}");
            return blank_exec(line);
        }
    };
    let label = command_label(&argv[0]).to_vec();

    if display.full_path {
        match procs.exe_path(pid) {
            Ok(exe) => push_quoted(&mut line, &exe),
            Err(err) => {
                debug!("Failed to resolve the executable of process {pid}: {err:#}");
                push_quoted(&mut line, &argv[0]);
            }
        }
    } else {
        push_quoted(&mut line, &argv[0]);
    }

    if display.show_args {
        for arg in &argv[1..] {
            line.push(b' ');
            push_quoted(&mut line, arg);
        }
    }

    if display.show_env {
        match procs.envp(pid) {
            Ok(envp) => {
                for var in &envp {
                    line.push(b' ');
                    push_env_entry(&mut line, var);
                }
            }
            Err(_) => line.extend_from_slice(b" -"),
        }
    }

    line.push(b'\n');
    RenderedExec { line, label }
}

fn blank_exec(mut line: Vec<u8>) -> RenderedExec {
    line.push(b'\n');
    RenderedExec {
        line,
        label: b"?".to_vec(),
    }
}

/// `KEY=value` is quoted on both sides of the `=`, so the `=` itself never
/// forces quoting.
fn push_env_entry(out: &mut Vec<u8>, var: &[u8]) {
    match var.iter().position(|&b| b == b'=') {
        Some(eq) => {
            push_quoted(out, &var[..eq]);
            out.push(b'=');
            push_quoted(out, &var[eq + 1..]);
        }
        None => push_quoted(out, var),
    }
}

/// Labels are printed as is, except for control characters.
fn push_label(out: &mut Vec<u8>, label: &[u8]) {
    out.extend(
        label
            .iter()
            .map(|&b| if b < 0x20 || b == 0x7f { b'?' } else { b }),
    );
}

pub fn render_exit(
    pid: Pid,
    entry: &LedgerEntry,
    status: ExitStatus,
    timestamp: Duration,
    display: &DisplayOptions,
) -> Vec<u8> {
    let mut line = Vec::with_capacity(64);
    push_prefix(&mut line, pid, Some(b'-'), entry.depth, display.flat);
    push_label(&mut line, &entry.label);
    let _ = writeln!(
        line,
        " exited {status} time={}",
        format_elapsed(entry.start, timestamp)
    );
    line
}

/// Summary of the previous image of a process that exec'd again.
pub fn render_reexec(
    pid: Pid,
    entry: &LedgerEntry,
    timestamp: Duration,
    display: &DisplayOptions,
) -> Vec<u8> {
    let mut line = Vec::with_capacity(64);
    push_prefix(&mut line, pid, Some(b'-'), entry.depth, display.flat);
    push_label(&mut line, &entry.label);
    let _ = writeln!(line, " execed time={}", format_elapsed(entry.start, timestamp));
    line
}
