//! A lazy view of the live process table.
//!
//! Each step of the iterator consults the table as it is at that moment;
//! nothing is pre-loaded, so callers observe processes appearing and
//! vanishing mid-sweep rather than a stale copy.

use nix::{errno::Errno, unistd::Pid};
use std::{fs, path::Path};

/// One process-table record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    /// The process id.
    pub pid: Pid,

    /// Its parent's id.
    pub ppid: Pid,
}

/// Iterator over the processes alive right now.
pub(crate) struct ProcessTable {
    /// The table directory, read one entry at a time.
    dir: fs::ReadDir,
}

impl ProcessTable {
    /// Open a fresh view of the table. Restartable: call again to rescan.
    pub fn snapshot() -> Result<Self, Errno> {
        let dir = fs::read_dir("/proc")
            .map_err(|err| err.raw_os_error().map_or(Errno::EIO, Errno::from_raw))?;
        Ok(Self { dir })
    }
}

impl Iterator for ProcessTable {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let entry = match self.dir.next()? {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|name| name.parse::<i32>().ok()) else {
                continue;
            };
            // A process that exited between readdir and here just drops out.
            let Some(ppid) = read_ppid(&entry.path()) else {
                continue;
            };
            return Some(Entry {
                pid: Pid::from_raw(pid),
                ppid,
            });
        }
    }
}

/// Parse the parent pid out of a stat record. The command field may contain
/// anything, including parentheses, so the parse anchors on the last `)`.
fn read_ppid(dir: &Path) -> Option<Pid> {
    let stat = fs::read_to_string(dir.join("stat")).ok()?;
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    let mut fields = rest.split_ascii_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse::<i32>().ok().map(Pid::from_raw)
}
