use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FuzzerError>;

/// Error kinds for the fuzzer core.
///
/// Every snapshot/trace/delivery variant is fatal to the worker that
/// hit it and triggers a harness reset; `CrashFile` is handled by the
/// crash sink, which logs the offending bytes and keeps waiting;
/// `UnsupportedTarget` tears the whole program down before any worker
/// starts.
#[derive(Debug, Error)]
pub enum FuzzerError {
    /// ELF open, pipe creation, fork/exec or the initial wait failed.
    #[error("target setup failed: {0}")]
    TargetSetup(String),

    /// The target is not a 32-bit or 64-bit x86 ELF.
    #[error("unsupported target binary: {0}")]
    UnsupportedTarget(String),

    /// The tracee exited, segfaulted or aborted before reaching the
    /// first read from stdin, so there is nothing to snapshot.
    #[error("target exited before the snapshot point")]
    EarlyExit,

    /// A debug-trace call failed while driving the tracee to the
    /// snapshot point.
    #[error("snapshot setup failed: {0}")]
    SnapshotSetup(String),

    /// Parsing the tracee's memory map, reading its memory or getting
    /// its registers failed.
    #[error("snapshot capture failed: {0}")]
    SnapshotCapture(String),

    /// Writing the tracee's memory or setting its registers failed.
    #[error("snapshot restore failed: {0}")]
    SnapshotRestore(String),

    /// Resume/wait/getregs failed inside the trace loop.
    #[error("trace loop failed: {0}")]
    Trace(String),

    /// Opening or writing the tracee's stdin through the proc
    /// filesystem failed with something other than EAGAIN.
    #[error("input delivery failed: {0}")]
    InputDelivery(String),

    /// The crash dump file could not be written.
    #[error("crash file write failed: {0}")]
    CrashFile(#[source] io::Error),

    /// The seed input file could not be read or parsed.
    #[error("seed input unusable: {0}")]
    SeedInput(#[source] io::Error),
}
