//! A launched child and its reaping: single-process wait with exit
//! classification, and the all-children sweep over the live process table.

use crate::{
    error::{Error, Result},
    table::ProcessTable,
};
use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, kill},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{Pid, getpid},
};
use std::fs::File;

/// Why a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The child ran to completion and returned a code.
    Exited,

    /// The child was torn down by a fault-class termination.
    Signaled,
}

/// Outcome of a single-process wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The child has not terminated; not a failure.
    Running,

    /// The child terminated. The handle is closed; waiting again fails.
    Done {
        /// Exit code, or the signal number for fault-class terminations.
        code: i32,

        /// How the child went.
        reason: ExitReason,
    },
}

/// Outcome of the all-children wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAll {
    /// Every discovered child has finished.
    AllDone,

    /// At least one child remains.
    SomeRunning,
}

/// A launched child process.
///
/// Dropping a `Process` does not touch the child: a launcher error after a
/// successful spawn leaves the child alive by contract, so the record never
/// assumes it owns the child's lifetime. Callers that care must wait or
/// terminate explicitly.
pub struct Process {
    /// The waitable handle; cleared exactly once by a terminal wait.
    child: Option<Pid>,

    /// The native id, retained for diagnostics after reaping.
    pid: Pid,

    /// The command line the child was launched with. Diagnostic only.
    invoked: String,

    /// Parent-side end of the stdin pipe, when one was configured.
    stdin: Option<File>,

    /// Parent-side end of the stdout pipe.
    stdout: Option<File>,

    /// Parent-side end of the stderr pipe.
    stderr: Option<File>,
}

impl Process {
    /// Record a freshly spawned child. Only the launcher constructs these.
    pub(crate) fn new(
        pid: Pid,
        invoked: String,
        stdin: Option<File>,
        stdout: Option<File>,
        stderr: Option<File>,
    ) -> Self {
        Self {
            child: Some(pid),
            pid,
            invoked,
            stdin,
            stdout,
            stderr,
        }
    }

    /// The child's native id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The command line the child was launched with.
    pub fn invoked(&self) -> &str {
        &self.invoked
    }

    /// Writable end of the child's standard input, if piped.
    pub fn stdin(&mut self) -> Option<&mut File> {
        self.stdin.as_mut()
    }

    /// Readable end of the child's standard output, if piped.
    pub fn stdout(&mut self) -> Option<&mut File> {
        self.stdout.as_mut()
    }

    /// Readable end of the child's standard error, if piped.
    pub fn stderr(&mut self) -> Option<&mut File> {
        self.stderr.as_mut()
    }

    /// Close the parent's end of the stdin pipe, sending the child EOF.
    pub fn close_stdin(&mut self) {
        let _ = self.stdin.take();
    }

    /// Wait for the child to terminate.
    ///
    /// The blocking variant waits indefinitely; the non-blocking variant
    /// polls once and reports [`Wait::Running`] without error. A terminal
    /// result closes the waitable handle exactly once, and any wait after
    /// that fails with [`Error::AlreadyWaited`].
    pub fn wait(&mut self, blocking: bool) -> Result<Wait> {
        let Some(pid) = self.child else {
            return Err(Error::AlreadyWaited);
        };
        let flags = if blocking {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };

        loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::StillAlive) => return Ok(Wait::Running),
                Ok(status) => {
                    if let Some((code, reason)) = classify(status) {
                        self.child = None;
                        return Ok(Wait::Done { code, reason });
                    }
                    // Stop/continue notifications are not termination.
                    if !blocking {
                        return Ok(Wait::Running);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // Reaped elsewhere; the handle is gone either way.
                    self.child = None;
                    return Err(Error::Os(Errno::ECHILD));
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Ask the child to terminate. Does not consume the handle; follow with
    /// [`Process::wait`] to collect the status.
    pub fn terminate(&mut self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send a signal to the child. A child that already left the process
    /// table is not an error.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.child else {
            return Err(Error::AlreadyWaited);
        };
        match kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }
}

/// Map a native wait status onto the (code, reason) pair. Fault-class
/// terminations report the signal number.
fn classify(status: WaitStatus) -> Option<(i32, ExitReason)> {
    match status {
        WaitStatus::Exited(_, code) => Some((code, ExitReason::Exited)),
        WaitStatus::Signaled(_, signal, _) => Some((signal as i32, ExitReason::Signaled)),
        _ => None,
    }
}

/// Wait on every child of the calling process.
///
/// The live process table is swept entry by entry for children of this
/// process. Already-exited children are reaped immediately without
/// blocking. The blocking variant collects still-active children in batches
/// no larger than the wait primitive's capacity and waits each batch out
/// before moving on; the non-blocking variant only classifies. Returns
/// whether every discovered child has finished.
pub fn wait_all(blocking: bool) -> Result<WaitAll> {
    /// How many children one blocking batch may hold.
    const BATCH: usize = 64;

    let me = getpid();
    let mut active = 0usize;
    let mut batch: Vec<Pid> = Vec::new();

    for entry in ProcessTable::snapshot()? {
        if entry.ppid != me {
            continue;
        }
        match waitpid(entry.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                active = active.saturating_add(1);
                if blocking {
                    batch.push(entry.pid);
                    if batch.len() == BATCH {
                        active = active.saturating_sub(drain(&mut batch));
                    }
                }
            }
            // Exited: reaped on the spot, nothing to wait for.
            Ok(_) => {}
            // Not waitable by us (already reaped, or never ours to reap).
            Err(Errno::ECHILD) => {}
            Err(errno) => return Err(errno.into()),
        }
    }

    if blocking {
        active = active.saturating_sub(drain(&mut batch));
    }

    if active == 0 {
        Ok(WaitAll::AllDone)
    } else {
        Ok(WaitAll::SomeRunning)
    }
}

/// Block until every child in the batch is gone; returns how many finished.
fn drain(batch: &mut Vec<Pid>) -> usize {
    let mut finished = 0usize;
    for pid in batch.drain(..) {
        loop {
            match waitpid(pid, None) {
                Ok(status) if classify(status).is_some() => break,
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(_) => break,
            }
        }
        finished = finished.saturating_add(1);
    }
    finished
}
