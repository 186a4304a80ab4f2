//! The descriptor-inheritance window.
//!
//! Marking a descriptor inheritable is process-wide mutable state: a fork on
//! another thread between "mark" and "restore" captures descriptors it was
//! never meant to see, and a restore racing a fork strips descriptors the
//! other launch still needs. One lock serializes the whole
//! mark/spawn/restore sequence; [`InheritGuard`] carries the snapshot of
//! every flag it altered and restores all of them on every exit path.

use crate::{
    attr::{descriptor_flags, set_inheritable},
    error::Result,
};
use log::warn;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use parking_lot::{Mutex, MutexGuard};
use std::{
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Serializes every launch's inheritance window.
static WINDOW: Mutex<()> = Mutex::new(());

/// Total acquisitions of the window, for instrumentation.
static ACQUIRED: AtomicUsize = AtomicUsize::new(0);

/// Total releases of the window, for instrumentation.
static RELEASED: AtomicUsize = AtomicUsize::new(0);

/// Exclusive hold on the inheritance window for one launch.
pub(crate) struct LaunchLock {
    /// The underlying mutex guard.
    _guard: MutexGuard<'static, ()>,
}

impl LaunchLock {
    /// Block until the window is free and take it.
    pub fn acquire() -> Self {
        let guard = WINDOW.lock();
        let _ = ACQUIRED.fetch_add(1, Ordering::SeqCst);
        Self { _guard: guard }
    }

    /// Lifetime acquire and release counts. Equal whenever no launch is in
    /// flight; a persistent gap means a leaked window.
    pub fn balance() -> (usize, usize) {
        (ACQUIRED.load(Ordering::SeqCst), RELEASED.load(Ordering::SeqCst))
    }
}
impl Drop for LaunchLock {
    fn drop(&mut self) {
        let _ = RELEASED.fetch_add(1, Ordering::SeqCst);
    }
}

/// Snapshot of the descriptor flags altered for one launch.
///
/// Building the explicit inherit list is staged: query the current flags,
/// record them, force the descriptor inheritable, publish it on the list.
/// A failure at any stage leaves the already-altered descriptors to the
/// drop impl, which restores every captured flag unconditionally.
#[derive(Default)]
pub(crate) struct InheritGuard {
    /// Captured pre-launch flags, restored on drop.
    saved: Vec<(RawFd, FdFlag)>,

    /// The descriptors the child must inherit.
    list: Vec<RawFd>,
}

impl InheritGuard {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the descriptor's current flags, force it inheritable, and
    /// add it to the explicit inherit list.
    pub fn mark(&mut self, fd: BorrowedFd) -> Result<()> {
        let flags = descriptor_flags(fd)?;
        self.saved.push((fd.as_raw_fd(), flags));
        set_inheritable(fd, true)?;
        self.list.push(fd.as_raw_fd());
        Ok(())
    }

    /// The explicit inherit list collected so far.
    pub fn list(&self) -> &[RawFd] {
        &self.list
    }
}

impl Drop for InheritGuard {
    fn drop(&mut self) {
        for (fd, flags) in self.saved.drain(..) {
            // The launcher keeps every marked descriptor open for at least
            // the life of this guard.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(errno) = fcntl(borrowed, FcntlArg::F_SETFD(flags)) {
                warn!("failed to restore descriptor {fd} flags: {errno}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{fcntl::OFlag, unistd::pipe2};
    use std::os::fd::AsFd;

    #[test]
    fn flags_restored_on_drop() {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        {
            let mut guard = InheritGuard::new();
            guard.mark(read.as_fd()).unwrap();
            guard.mark(write.as_fd()).unwrap();
            assert_eq!(guard.list().len(), 2);
            assert!(!descriptor_flags(read.as_fd()).unwrap().contains(FdFlag::FD_CLOEXEC));
        }
        assert!(descriptor_flags(read.as_fd()).unwrap().contains(FdFlag::FD_CLOEXEC));
        assert!(descriptor_flags(write.as_fd()).unwrap().contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn window_acquires_balance_releases() {
        let (before_acquired, _) = LaunchLock::balance();
        drop(LaunchLock::acquire());

        // Launches on other test threads hold the window transiently; give
        // the counters a moment to settle before comparing.
        for _ in 0..200 {
            let (acquired, released) = LaunchLock::balance();
            if acquired == released && acquired > before_acquired {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (acquired, released) = LaunchLock::balance();
        assert_eq!(acquired, released);
    }
}
