//! Architecture facts for the two supported tracee flavors.
//!
//! A 32-bit tracee driven from a 64-bit tracer still reports through
//! the 64-bit register file: the syscall number lands in `orig_rax`
//! and `ebx` is visible in `rbx`. All predicates below take the
//! register set exactly as `ptrace::getregs` returns it.

use std::fs;
use std::path::Path;

use libc::user_regs_struct;

use crate::errors::{FuzzerError, Result};

pub const X64_READ: u64 = 0x0;
pub const X64_EXIT: u64 = 0x3c;
pub const X64_EXIT_GROUP: u64 = 0xe7;

pub const X86_READ: u64 = 0x3;
pub const X86_EXIT: u64 = 0x1;
pub const X86_EXIT_GROUP: u64 = 0xfc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupportedArch {
    X86,
    X64,
}

impl SupportedArch {
    /// True when `regs` describe a syscall-stop for a read from fd 0.
    /// This is the snapshot-point condition: the instant just before
    /// the target consumes its input, with startup already done.
    pub fn at_stdin_read(self, regs: &user_regs_struct) -> bool {
        match self {
            SupportedArch::X64 => regs.orig_rax == X64_READ && regs.rdi == 0,
            SupportedArch::X86 => regs.orig_rax == X86_READ && regs.rbx == 0,
        }
    }

    /// True when `syscallno` is `exit` or `exit_group`.
    pub fn is_exit_syscall(self, syscallno: u64) -> bool {
        match self {
            SupportedArch::X64 => syscallno == X64_EXIT || syscallno == X64_EXIT_GROUP,
            SupportedArch::X86 => syscallno == X86_EXIT || syscallno == X86_EXIT_GROUP,
        }
    }
}

/// Reads the ELF header of `path` and returns the tracee architecture.
/// Anything other than 32-bit or 64-bit x86 is fatal for the whole
/// program, not just one worker.
pub fn detect_arch(path: &Path) -> Result<SupportedArch> {
    let bytes = fs::read(path)
        .map_err(|e| FuzzerError::TargetSetup(format!("reading {}: {}", path.display(), e)))?;
    let elf = goblin::elf::Elf::parse(&bytes)
        .map_err(|e| FuzzerError::UnsupportedTarget(format!("{}: {}", path.display(), e)))?;
    match (elf.is_64, elf.header.e_machine) {
        (true, goblin::elf::header::EM_X86_64) => Ok(SupportedArch::X64),
        (false, goblin::elf::header::EM_386) => Ok(SupportedArch::X86),
        (_, machine) => Err(FuzzerError::UnsupportedTarget(format!(
            "{}: e_machine {:#x} is not x86",
            path.display(),
            machine
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_with(orig_rax: u64, rdi: u64, rbx: u64) -> user_regs_struct {
        let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
        regs.orig_rax = orig_rax;
        regs.rdi = rdi;
        regs.rbx = rbx;
        regs
    }

    #[test]
    fn stdin_read_condition_is_arch_dependent() {
        let read_64 = regs_with(X64_READ, 0, 99);
        assert!(SupportedArch::X64.at_stdin_read(&read_64));
        assert!(!SupportedArch::X86.at_stdin_read(&read_64));

        let read_32 = regs_with(X86_READ, 99, 0);
        assert!(SupportedArch::X86.at_stdin_read(&read_32));
        assert!(!SupportedArch::X64.at_stdin_read(&read_32));

        // A read from some other descriptor is not the snapshot point.
        assert!(!SupportedArch::X64.at_stdin_read(&regs_with(X64_READ, 3, 0)));
        assert!(!SupportedArch::X86.at_stdin_read(&regs_with(X86_READ, 0, 5)));
    }

    #[test]
    fn exit_class_syscalls() {
        assert!(SupportedArch::X64.is_exit_syscall(X64_EXIT));
        assert!(SupportedArch::X64.is_exit_syscall(X64_EXIT_GROUP));
        assert!(!SupportedArch::X64.is_exit_syscall(X64_READ));
        assert!(SupportedArch::X86.is_exit_syscall(X86_EXIT));
        assert!(SupportedArch::X86.is_exit_syscall(X86_EXIT_GROUP));
        assert!(!SupportedArch::X86.is_exit_syscall(X64_EXIT));
    }

    #[test]
    fn detects_own_binary_as_x64() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(detect_arch(&exe).unwrap(), SupportedArch::X64);
    }

    #[test]
    fn rejects_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-elf");
        fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();
        assert!(detect_arch(&path).is_err());
    }
}
