//! The autokill group: created lazily, once per parent process, and
//! assigned every launch that asked for it. Members arm their own death
//! signal during spawn, so parent termination tears the whole set down; the
//! group object tracks membership and covers explicit teardown.

use log::warn;
use nix::{
    errno::Errno,
    sys::{
        prctl,
        signal::{Signal, killpg},
    },
    unistd::Pid,
};
use parking_lot::Mutex;

/// The process-wide group slot, filled on first use.
static GROUP: Mutex<Option<KillGroup>> = Mutex::new(None);

/// The native group object: the set of member pids, each leading its own
/// process group.
pub(crate) struct KillGroup {
    /// Assigned members. A member that already left the process table
    /// removes itself implicitly; teardown skips it.
    members: Vec<Pid>,
}

impl KillGroup {
    /// Create the group and configure its termination policy.
    fn create() -> Result<Self, Errno> {
        // Descendants of members reparent to us rather than to init, so the
        // group can still reach them after a member exits.
        match prctl::set_child_subreaper(true) {
            Ok(()) => {}
            // Kernels predating the subreaper flag permit descendants to
            // detach silently; members themselves stay covered by their
            // death signal.
            Err(Errno::EINVAL) => {
                warn!("no subreaper support; descendants of autokill children may detach");
            }
            Err(errno) => return Err(errno),
        }
        Ok(Self { members: Vec::new() })
    }

    /// Register a member. The member's own death signal is armed by the
    /// launcher; the group only has to remember it.
    fn assign(&mut self, member: Pid) {
        self.members.push(member);
    }
}

impl Drop for KillGroup {
    fn drop(&mut self) {
        for member in self.members.drain(..) {
            // Each member leads a process group, so one signal reaches its
            // descendants too.
            match killpg(member, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => warn!("failed to tear down process group {member}: {errno}"),
            }
        }
    }
}

/// Assign a freshly spawned autokill child to the process-wide group,
/// creating the group on first use.
pub(crate) fn assign(member: Pid) -> Result<(), Errno> {
    let mut slot = GROUP.lock();
    obtain(&mut slot, KillGroup::create)?.assign(member);
    Ok(())
}

/// Fill the group slot under its lock. The first successful creation wins;
/// a failed creation leaves the slot empty so a later launch may retry.
fn obtain(
    slot: &mut Option<KillGroup>,
    create: impl FnOnce() -> Result<KillGroup, Errno>,
) -> Result<&mut KillGroup, Errno> {
    if slot.is_none() {
        *slot = Some(create()?);
    }
    slot.as_mut().ok_or(Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    #[test]
    fn failed_creation_resets_for_retry() {
        let mut slot = None;
        assert!(obtain(&mut slot, || Err(Errno::EAGAIN)).is_err());
        assert!(slot.is_none());

        obtain(&mut slot, || Ok(KillGroup { members: Vec::new() }))
            .unwrap()
            .assign(Pid::from_raw(0x3fff_fff1));
        assert!(slot.is_some());

        // Keep teardown away from the fake member pid.
        if let Some(group) = slot.as_mut() {
            group.members.clear();
        }
    }

    #[test]
    fn concurrent_creation_happens_once() {
        let slot = Arc::new(Mutex::new(None));
        let created = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|offset| {
                let slot = Arc::clone(&slot);
                let created = Arc::clone(&created);
                thread::spawn(move || {
                    let mut slot = slot.lock();
                    obtain(&mut slot, || {
                        let _ = created.fetch_add(1, Ordering::SeqCst);
                        Ok(KillGroup { members: Vec::new() })
                    })
                    .unwrap()
                    .assign(Pid::from_raw(0x3fff_ff00 + offset));
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        let mut slot = slot.lock();
        let group = slot.as_mut().unwrap();
        assert_eq!(group.members.len(), 8);
        group.members.clear();
    }
}
