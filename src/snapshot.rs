//! Capture and restore of a stopped tracee's writable state, plus
//! input delivery through the proc filesystem.
//!
//! Memory travels through `/proc/<pid>/mem` rather than word-by-word
//! PTRACE_PEEKDATA/POKEDATA: whole-region positioned reads and writes
//! are orders of magnitude faster. Memory is copied whole, not
//! COW-tracked; fuzz targets are assumed small and short-lived.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};

use libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::errors::{FuzzerError, Result};
use crate::kernel_abi::SupportedArch;

/// One writable page range captured from the tracee. `data` is owned
/// exclusively by the enclosing [`Snapshot`]; the address and size
/// never change after capture.
pub struct MemoryRegion {
    pub start_addr: u64,
    pub size: u64,
    pub data: Vec<u8>,
}

/// Tracee state at the snapshot point: the full register file and
/// every writable mapping, captured at the same instruction boundary.
///
/// Created once per harness worker after the target reaches the first
/// read from stdin, then reused for every subsequent test case until
/// the worker exits. Regions are disjoint and sorted by start address
/// (the kernel emits the maps file in address order).
pub struct Snapshot {
    pid: Pid,
    saved_regs: user_regs_struct,
    segments: Vec<MemoryRegion>,
}

impl Snapshot {
    pub fn segments(&self) -> &[MemoryRegion] {
        &self.segments
    }
}

/// Resumes the traced child through syscall-stops until it is about to
/// perform its first read from fd 0, leaving it stopped there.
///
/// This anchors the snapshot just before input is consumed, so every
/// later iteration sees a process that has already finished startup
/// (argument parsing, library init, format-header reads). Any exit,
/// segfault or abort before that point means the target cannot be
/// fuzzed this way.
pub fn setup_snapshot_state(pid: Pid, arch: SupportedArch) -> Result<()> {
    loop {
        ptrace::syscall(pid, None)
            .map_err(|e| FuzzerError::SnapshotSetup(format!("resuming tracee: {}", e)))?;
        let status = waitpid(pid, Some(WaitPidFlag::__WALL))
            .map_err(|e| FuzzerError::SnapshotSetup(format!("waiting for tracee: {}", e)))?;
        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(FuzzerError::EarlyExit);
            }
            WaitStatus::Stopped(_, Signal::SIGSEGV) | WaitStatus::Stopped(_, Signal::SIGABRT) => {
                return Err(FuzzerError::EarlyExit);
            }
            WaitStatus::PtraceSyscall(_) => {
                let regs = ptrace::getregs(pid)
                    .map_err(|e| FuzzerError::SnapshotSetup(format!("reading registers: {}", e)))?;
                if arch.at_stdin_read(&regs) {
                    return Ok(());
                }
            }
            // Any other stop is unrelated to the snapshot point; keep
            // driving the tracee forward.
            _ => {}
        }
    }
}

/// Saves the writable memory and register file of the stopped tracee.
/// The caller must hold the tracee in a ptrace stop.
pub fn make_snapshot(pid: Pid) -> Result<Snapshot> {
    let maps_path = format!("/proc/{}/maps", pid);
    let maps = fs::read_to_string(&maps_path)
        .map_err(|e| FuzzerError::SnapshotCapture(format!("reading {}: {}", maps_path, e)))?;

    let mem_path = format!("/proc/{}/mem", pid);
    let mem = File::open(&mem_path)
        .map_err(|e| FuzzerError::SnapshotCapture(format!("opening {}: {}", mem_path, e)))?;

    let mut segments = Vec::new();
    for line in maps.lines() {
        let (start, end, perms) = parse_maps_line(line)
            .ok_or_else(|| FuzzerError::SnapshotCapture(format!("bad maps line: {}", line)))?;
        if !is_writable(perms) {
            continue;
        }
        let size = end - start;
        let mut data = vec![0u8; size as usize];
        mem.read_exact_at(&mut data, start).map_err(|e| {
            FuzzerError::SnapshotCapture(format!("reading {:#x}-{:#x}: {}", start, end, e))
        })?;
        segments.push(MemoryRegion {
            start_addr: start,
            size,
            data,
        });
    }

    let saved_regs = ptrace::getregs(pid)
        .map_err(|e| FuzzerError::SnapshotCapture(format!("reading registers: {}", e)))?;

    Ok(Snapshot {
        pid,
        saved_regs,
        segments,
    })
}

/// Writes every saved region back at its original address, then
/// restores the register file. Region order is insignificant; saved
/// regions never overlap.
pub fn restore_snapshot(snap: &Snapshot) -> Result<()> {
    let mem_path = format!("/proc/{}/mem", snap.pid);
    let mem = OpenOptions::new()
        .write(true)
        .open(&mem_path)
        .map_err(|e| FuzzerError::SnapshotRestore(format!("opening {}: {}", mem_path, e)))?;

    for region in &snap.segments {
        mem.write_all_at(&region.data, region.start_addr).map_err(|e| {
            FuzzerError::SnapshotRestore(format!(
                "writing {:#x}+{:#x}: {}",
                region.start_addr, region.size, e
            ))
        })?;
    }

    ptrace::setregs(snap.pid, snap.saved_regs)
        .map_err(|e| FuzzerError::SnapshotRestore(format!("restoring registers: {}", e)))
}

/// Delivers `input` to the tracee's standard input.
///
/// fd 0 of the tracee is the read end of a pipe; opening the proc link
/// for writing yields the write side of that same pipe. A full pipe
/// reports EAGAIN, which counts as delivered -- the tracee will consume
/// what fits on its next schedule.
pub fn write_to_proc(pid: Pid, input: &[u8]) -> Result<()> {
    let path = format!("/proc/{}/fd/0", pid);
    let mut stdin = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(&path)
        .map_err(|e| FuzzerError::InputDelivery(format!("opening {}: {}", path, e)))?;
    match stdin.write(input) {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(FuzzerError::InputDelivery(format!(
            "writing {}: {}",
            path, e
        ))),
    }
}

/// Discards bytes a previous iteration left in the stdin pipe.
///
/// Pipe contents are kernel state outside the memory snapshot, so
/// restore alone cannot clear them; without this, a target that reads
/// only part of its input would see stale bytes next iteration.
pub fn drain_stdin(pid: Pid) -> Result<()> {
    let path = format!("/proc/{}/fd/0", pid);
    let mut stdin = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(&path)
        .map_err(|e| FuzzerError::InputDelivery(format!("opening {}: {}", path, e)))?;
    let mut sink = [0u8; 4096];
    loop {
        match stdin.read(&mut sink) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                return Err(FuzzerError::InputDelivery(format!(
                    "draining {}: {}",
                    path, e
                )))
            }
        }
    }
}

/// Parses the address range and permission fields of one
/// `/proc/<pid>/maps` line, e.g.
/// `55d0e8a9c000-55d0e8abd000 rw-p 00000000 00:00 0 [heap]`.
fn parse_maps_line(line: &str) -> Option<(u64, u64, &str)> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let dash = range.find('-')?;
    let start = u64::from_str_radix(&range[..dash], 16).ok()?;
    let end = u64::from_str_radix(&range[dash + 1..], 16).ok()?;
    Some((start, end, perms))
}

/// Only regions with `w` at index 1 of the permission string belong in
/// a snapshot; code, read-only data and shared library text are
/// invariant by contract.
fn is_writable(perms: &str) -> bool {
    perms.as_bytes().get(1) == Some(&b'w')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_maps_lines() {
        let line = "55d0e8a9c000-55d0e8abd000 rw-p 00000000 00:00 0 [heap]";
        let (start, end, perms) = parse_maps_line(line).unwrap();
        assert_eq!(start, 0x55d0e8a9c000);
        assert_eq!(end, 0x55d0e8abd000);
        assert_eq!(perms, "rw-p");

        let anon = "7ffc7e37a000-7ffc7e39b000 rw-p 00000000 00:00 0";
        assert!(parse_maps_line(anon).is_some());

        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("garbage").is_none());
        assert!(parse_maps_line("nothex-55 rw-p").is_none());
    }

    #[test]
    fn writable_filter_checks_index_one() {
        assert!(is_writable("rw-p"));
        assert!(is_writable("rw-s"));
        assert!(is_writable("-w-p"));
        assert!(!is_writable("r--p"));
        assert!(!is_writable("r-xp"));
        assert!(!is_writable("---p"));
        assert!(!is_writable(""));
    }

    #[test]
    fn own_maps_contain_writable_regions() {
        let maps = fs::read_to_string("/proc/self/maps").unwrap();
        let mut writable = 0;
        let mut last_start = 0u64;
        for line in maps.lines() {
            let (start, end, perms) = parse_maps_line(line).unwrap();
            assert!(start < end, "degenerate region in {}", line);
            assert!(start >= last_start, "maps not sorted at {}", line);
            last_start = start;
            if is_writable(perms) {
                writable += 1;
            }
        }
        assert!(writable > 0);
    }
}
