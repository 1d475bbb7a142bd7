//! Harness workers: each supervises one target process on its own OS
//! thread, resets it by snapshot between inputs, and classifies every
//! run as novel, crashing or benign.
//!
//! ptrace requests only work from the thread that attached, so a
//! worker is one `std::thread` for its whole life and every call
//! against its tracee happens on that thread.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

use crate::errors::{FuzzerError, Result};
use crate::kernel_abi::SupportedArch;
use crate::snapshot::{
    drain_stdin, make_snapshot, restore_snapshot, setup_snapshot_state, write_to_proc,
};
use crate::test_case::TestCase;
use crate::trace::{interesting_regs, ExecTrace, UniqueTraceSet};

/// Wall-clock bound on a single traced run; crude defense against
/// inputs that drive the target into an infinite loop.
pub const TRACE_TIMEOUT: Duration = Duration::from_millis(30);

/// Extra grace for the run-to-completion oracle: an AddressSanitizer
/// report takes longer to format than the trace budget allows.
const ORACLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive failed sessions tolerated on one worker before the
/// whole program gives up.
const MAX_CONSECUTIVE_RESETS: u32 = 5;

/// Fixed crash dump path, written in the working directory.
pub const CRASH_FILE: &str = "bad.txt";

const ASAN_MARKER: &[u8] = b"ERROR: AddressSanitizer";

/// How a single traced run ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RunEnd {
    /// The tracee reached the entry stop of an exit-class syscall. It
    /// is held there and has not actually exited.
    ExitSyscall,
    /// SIGSEGV with no preceding SIGABRT: the crash the fuzzer hunts.
    Segfault,
    /// SIGABRT. AddressSanitizer and glibc abort paths land here;
    /// benign for the ptrace oracle.
    Abort,
    /// The time budget expired; the tracee was stopped where it was.
    Timeout,
    /// The process is actually gone. The worker must reset.
    Gone,
}

/// A child being supervised under ptrace. Dropping it kills and reaps
/// the process, so no exit path leaks a pid.
struct TracedTarget {
    child: Child,
    pid: Pid,
}

impl Drop for TracedTarget {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Forks and execs `target` with tracing enabled and fd 0 backed by a
/// pipe, then consumes the initial execve stop.
///
/// The pipe's only purpose is to make `/proc/<pid>/fd/0` resolve to a
/// live pipe the fuzzer can reopen; nothing is ever written through
/// the original write end, which is closed right after the spawn.
fn spawn_traced(target: &Path) -> Result<TracedTarget> {
    let (stdin_read, stdin_write) =
        unistd::pipe().map_err(|e| FuzzerError::TargetSetup(format!("creating pipe: {}", e)))?;

    let mut cmd = Command::new(target);
    cmd.stdin(unsafe { Stdio::from_raw_fd(stdin_read) })
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            ptrace::traceme().map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        });
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = unistd::close(stdin_write);
            return Err(FuzzerError::TargetSetup(format!(
                "spawning {}: {}",
                target.display(),
                e
            )));
        }
    };
    let _ = unistd::close(stdin_write);
    let pid = Pid::from_raw(child.id() as i32);
    let tracee = TracedTarget { child, pid };

    // The execve under TRACEME delivers the initial signal stop.
    match waitpid(pid, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Stopped(..)) => {}
        Ok(status) => {
            return Err(FuzzerError::TargetSetup(format!(
                "unexpected initial wait status: {:?}",
                status
            )));
        }
        Err(e) => {
            return Err(FuzzerError::TargetSetup(format!("initial wait: {}", e)));
        }
    }
    ptrace::setoptions(
        pid,
        Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL,
    )
    .map_err(|e| FuzzerError::TargetSetup(format!("setting trace options: {}", e)))?;

    Ok(tracee)
}

/// Traps on every syscall entry and exit, recording the fingerprint at
/// each, until the run terminates or the time budget expires.
///
/// In every outcome except `Gone` the tracee is left in a ptrace stop
/// so the snapshot can be restored over it. Exit-class syscalls are
/// intercepted at their entry stop, before they execute, which is what
/// lets one pid serve every iteration of the worker.
fn trace_syscalls(pid: Pid, arch: SupportedArch) -> Result<(ExecTrace, RunEnd)> {
    let mut exec_trace = ExecTrace::default();
    let deadline = Instant::now() + TRACE_TIMEOUT;
    loop {
        ptrace::syscall(pid, None)
            .map_err(|e| FuzzerError::Trace(format!("resuming tracee: {}", e)))?;
        let status = match wait_with_deadline(pid, deadline)? {
            Some(status) => status,
            None => {
                stop_tracee(pid)?;
                return Ok((exec_trace, RunEnd::Timeout));
            }
        };
        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Ok((exec_trace, RunEnd::Gone));
            }
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                return Ok((exec_trace, RunEnd::Segfault));
            }
            WaitStatus::Stopped(_, Signal::SIGABRT) => {
                return Ok((exec_trace, RunEnd::Abort));
            }
            WaitStatus::PtraceSyscall(_) => {
                let regs = ptrace::getregs(pid)
                    .map_err(|e| FuzzerError::Trace(format!("reading registers: {}", e)))?;
                let fingerprint = interesting_regs(&regs);
                exec_trace.trace.push(fingerprint);
                if arch.is_exit_syscall(fingerprint.rax) {
                    return Ok((exec_trace, RunEnd::ExitSyscall));
                }
            }
            // Remaining signal stops are swallowed without delivery;
            // letting them through would only perturb the trace.
            _ => {}
        }
    }
}

/// Polls for a status change until `deadline`. `None` means the budget
/// expired with the tracee still running.
fn wait_with_deadline(pid: Pid, deadline: Instant) -> Result<Option<WaitStatus>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_micros(100));
            }
            Ok(status) => return Ok(Some(status)),
            Err(e) => return Err(FuzzerError::Trace(format!("waiting for tracee: {}", e))),
        }
    }
}

/// Forces a running tracee into a stop and consumes the stop event. If
/// the tracee won a race and hit a syscall-stop first, that stop is
/// consumed instead and the pending SIGSTOP is swallowed by the next
/// trace loop.
fn stop_tracee(pid: Pid) -> Result<()> {
    signal::kill(pid, Signal::SIGSTOP)
        .map_err(|e| FuzzerError::Trace(format!("interrupting tracee: {}", e)))?;
    match waitpid(pid, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => Err(FuzzerError::Trace(
            "tracee exited while being stopped".to_string(),
        )),
        Ok(_) => Ok(()),
        Err(e) => Err(FuzzerError::Trace(format!(
            "waiting for interrupted tracee: {}",
            e
        ))),
    }
}

/// Writes the crashing input to `path`: exactly the input bytes, no
/// framing, no trailer. Overwrites any previous dump.
pub fn write_crash_file(path: &Path, case: &TestCase) -> Result<()> {
    let mut f = File::create(path).map_err(FuzzerError::CrashFile)?;
    f.write_all(&case.input).map_err(FuzzerError::CrashFile)
}

/// Writes the crashing input to the fixed dump file in the working
/// directory.
pub fn crash_report(case: &TestCase) -> Result<()> {
    write_crash_file(Path::new(CRASH_FILE), case)
}

/// True when `stderr` contains an AddressSanitizer report.
pub fn stderr_indicates_crash(stderr: &[u8]) -> bool {
    stderr
        .windows(ASAN_MARKER.len())
        .any(|window| window == ASAN_MARKER)
}

/// The snapshot-based worker: one target process, restored between
/// inputs, classified by syscall trace and terminating signal.
pub struct HarnessWorker {
    id: usize,
    target: PathBuf,
    arch: SupportedArch,
    inputs: Receiver<TestCase>,
    interesting: Sender<TestCase>,
    crashes: Sender<TestCase>,
}

impl HarnessWorker {
    pub fn new(
        id: usize,
        target: PathBuf,
        arch: SupportedArch,
        inputs: Receiver<TestCase>,
        interesting: Sender<TestCase>,
        crashes: Sender<TestCase>,
    ) -> HarnessWorker {
        HarnessWorker {
            id,
            target,
            arch,
            inputs,
            interesting,
            crashes,
        }
    }

    /// Runs until the input channel closes. Worker-fatal errors drop
    /// the current test case, tear the tracee down and re-enter from
    /// spawn; too many consecutive failures abort the program rather
    /// than spin on a target that cannot be harnessed.
    pub fn run(mut self) {
        let mut consecutive_failures = 0u32;
        loop {
            match self.run_session(&mut consecutive_failures) {
                Ok(()) => return,
                Err(err) => {
                    consecutive_failures += 1;
                    log::error!("harness {}: resetting after error: {}", self.id, err);
                    if consecutive_failures >= MAX_CONSECUTIVE_RESETS {
                        log::error!(
                            "harness {}: {} consecutive failures, giving up",
                            self.id,
                            consecutive_failures
                        );
                        std::process::exit(1);
                    }
                }
            }
        }
    }

    /// One worker session: spawn, reach the snapshot point, snapshot,
    /// then cycle test cases until the input channel closes or a fatal
    /// error surfaces. The tracee (and with it the stdin pipe) is
    /// released on every exit path by `TracedTarget`'s drop.
    fn run_session(&mut self, consecutive_failures: &mut u32) -> Result<()> {
        let tracee = spawn_traced(&self.target)?;
        setup_snapshot_state(tracee.pid, self.arch)?;
        let snapshot = make_snapshot(tracee.pid)?;
        log::info!(
            "harness {}: pid {} snapshotted at first stdin read ({} writable regions)",
            self.id,
            tracee.pid,
            snapshot.segments().len()
        );

        let mut unique_traces = UniqueTraceSet::new();
        loop {
            let case = match self.inputs.recv() {
                Ok(case) => case,
                Err(_) => {
                    log::info!("harness {}: input channel closed", self.id);
                    return Ok(());
                }
            };

            drain_stdin(tracee.pid)?;
            write_to_proc(tracee.pid, &case.input)?;
            let (exec_trace, end) = trace_syscalls(tracee.pid, self.arch)?;

            if unique_traces.insert_if_novel(&exec_trace) {
                log::debug!(
                    "harness {}: novel trace #{} ({} stops)",
                    self.id,
                    unique_traces.len(),
                    exec_trace.trace.len()
                );
                // The feedback signal is advisory; never block the
                // worker on it. A full queue just loses this hint.
                let _ = self.interesting.try_send(case.clone());
            }

            match end {
                RunEnd::Segfault => {
                    log::info!(
                        "harness {}: {}-byte input segfaulted pid {}",
                        self.id,
                        case.input.len(),
                        tracee.pid
                    );
                    // Crash delivery must not be lost; block until the
                    // sink takes it. A closed channel means the
                    // program is already shutting down.
                    if self.crashes.send(case).is_err() {
                        return Ok(());
                    }
                }
                RunEnd::Abort => {
                    log::debug!(
                        "harness {}: target aborted; not a crash for the ptrace oracle",
                        self.id
                    );
                }
                RunEnd::Gone => {
                    return Err(FuzzerError::Trace(
                        "tracee exited underneath the harness".to_string(),
                    ));
                }
                RunEnd::ExitSyscall | RunEnd::Timeout => {}
            }

            restore_snapshot(&snapshot)?;
            *consecutive_failures = 0;
        }
    }
}

/// The alternative oracle: runs the target to completion once per
/// input, no ptrace and no snapshotting, and classifies a crash as
/// termination by SIGSEGV or an AddressSanitizer report on stderr.
/// This is the only oracle that catches ASan aborts, which reach the
/// ptrace oracle as benign SIGABRTs.
pub struct StderrOracleWorker {
    id: usize,
    target: PathBuf,
    inputs: Receiver<TestCase>,
    crashes: Sender<TestCase>,
}

impl StderrOracleWorker {
    pub fn new(
        id: usize,
        target: PathBuf,
        inputs: Receiver<TestCase>,
        crashes: Sender<TestCase>,
    ) -> StderrOracleWorker {
        StderrOracleWorker {
            id,
            target,
            inputs,
            crashes,
        }
    }

    pub fn run(self) {
        for case in self.inputs.iter() {
            match self.run_once(&case) {
                Ok(true) => {
                    log::info!(
                        "oracle harness {}: {}-byte input crashed the target",
                        self.id,
                        case.input.len()
                    );
                    if self.crashes.send(case).is_err() {
                        return;
                    }
                }
                Ok(false) => {}
                Err(err) => log::warn!("oracle harness {}: {}", self.id, err),
            }
        }
        log::info!("oracle harness {}: input channel closed", self.id);
    }

    fn run_once(&self, case: &TestCase) -> Result<bool> {
        let mut child = Command::new(&self.target)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                FuzzerError::TargetSetup(format!("spawning {}: {}", self.target.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The target may exit without reading everything; EPIPE
            // here is not a failure of the harness.
            let _ = stdin.write_all(&case.input);
        }

        let deadline = Instant::now() + ORACLE_TIMEOUT;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        break child.wait().map_err(|e| {
                            FuzzerError::TargetSetup(format!("reaping target: {}", e))
                        })?;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(FuzzerError::TargetSetup(format!(
                        "waiting for target: {}",
                        e
                    )));
                }
            }
        };

        let mut stderr = Vec::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_end(&mut stderr);
        }

        let segfaulted = status.signal() == Some(libc::SIGSEGV);
        Ok(segfaulted || stderr_indicates_crash(&stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::detect_arch;
    use crate::trace::same_trace;

    // /bin/sh reads its script through fd 0 when stdin is a pipe,
    // which makes it a convenient stand-in target: 64-bit, present
    // everywhere, and quick to reach the snapshot point.
    const SH: &str = "/bin/sh";

    fn sh_at_snapshot_point() -> (TracedTarget, SupportedArch) {
        let arch = detect_arch(Path::new(SH)).unwrap();
        let tracee = spawn_traced(Path::new(SH)).unwrap();
        setup_snapshot_state(tracee.pid, arch).unwrap();
        (tracee, arch)
    }

    #[test]
    fn asan_marker_detection() {
        assert!(stderr_indicates_crash(
            b"==123==ERROR: AddressSanitizer: stack-buffer-overflow on address 0x7ffe"
        ));
        assert!(!stderr_indicates_crash(b"all fine"));
        assert!(!stderr_indicates_crash(b""));
        assert!(!stderr_indicates_crash(b"ERROR: Something else"));
    }

    #[test]
    fn crash_file_holds_exactly_the_input_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        let case = TestCase::new(vec![0x00, 0x41, 0xff, 0x0a]);
        write_crash_file(&path, &case).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), case.input);

        // A second crash overwrites, never appends.
        let smaller = TestCase::new(b"x".to_vec());
        write_crash_file(&path, &smaller).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn reaches_snapshot_point_and_snapshots() {
        let (tracee, _arch) = sh_at_snapshot_point();
        let snapshot = make_snapshot(tracee.pid).unwrap();
        assert!(!snapshot.segments().is_empty());
        // Disjoint and sorted by start address.
        for pair in snapshot.segments().windows(2) {
            assert!(pair[0].start_addr + pair[0].size <= pair[1].start_addr);
        }
        for region in snapshot.segments() {
            assert_eq!(region.data.len() as u64, region.size);
        }
        restore_snapshot(&snapshot).unwrap();
    }

    #[test]
    fn delivers_input_through_proc_including_empty() {
        let (tracee, _arch) = sh_at_snapshot_point();
        write_to_proc(tracee.pid, b"exit 0\n").unwrap();
        drain_stdin(tracee.pid).unwrap();
        write_to_proc(tracee.pid, b"").unwrap();
        drain_stdin(tracee.pid).unwrap();
    }

    #[test]
    fn same_input_from_restored_snapshot_yields_same_trace() {
        let (tracee, arch) = sh_at_snapshot_point();
        let snapshot = make_snapshot(tracee.pid).unwrap();

        write_to_proc(tracee.pid, b"exit 0\n").unwrap();
        let (first, end_first) = trace_syscalls(tracee.pid, arch).unwrap();
        assert_eq!(end_first, RunEnd::ExitSyscall);
        assert!(!first.trace.is_empty());
        restore_snapshot(&snapshot).unwrap();

        drain_stdin(tracee.pid).unwrap();
        write_to_proc(tracee.pid, b"exit 0\n").unwrap();
        let (second, end_second) = trace_syscalls(tracee.pid, arch).unwrap();
        assert_eq!(end_second, RunEnd::ExitSyscall);
        assert!(same_trace(&first, &second));
        restore_snapshot(&snapshot).unwrap();
    }

    #[test]
    fn oracle_mode_classifies_clean_exit_as_benign() {
        let (crash_tx, crash_rx) = crossbeam_channel::bounded(1);
        let worker = StderrOracleWorker::new(
            0,
            PathBuf::from("/bin/cat"),
            crossbeam_channel::never(),
            crash_tx,
        );
        let crashed = worker.run_once(&TestCase::new(b"hello\n".to_vec())).unwrap();
        assert!(!crashed);
        assert!(crash_rx.try_recv().is_err());
    }
}
