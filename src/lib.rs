//! Child-process launching with explicit control over command-line
//! synthesis, environment blocks, descriptor inheritance, credentials, and
//! autokill process grouping.
//!
//! The crate is built around three moves: configure an [`Attributes`]
//! object through its setters, consume it with [`launch`], and reap the
//! returned [`Process`] with [`Process::wait`] or the process-wide
//! [`wait_all`]. Launching is synchronous and thread-safe; the
//! inheritance-sensitive part of every spawn is serialized behind one
//! process-wide lock so concurrent launches cannot leak descriptors into
//! each other's children.
//!
//! ```rust
//! use hatch::{Attributes, Blocking, StdioMode, Wait};
//! use std::io::{Read, Write};
//!
//! let mut attrs = Attributes::new();
//! attrs
//!     .set_io(
//!         StdioMode::Pipe(Blocking::Full),
//!         StdioMode::Pipe(Blocking::Full),
//!         StdioMode::Suppressed,
//!     )
//!     .unwrap();
//!
//! let mut child = hatch::launch("/bin/cat", &["-"], None, &mut attrs).unwrap();
//! child.stdin().unwrap().write_all(b"hello").unwrap();
//! child.close_stdin();
//!
//! let mut echoed = String::new();
//! child.stdout().unwrap().read_to_string(&mut echoed).unwrap();
//! assert_eq!(echoed, "hello");
//! assert!(matches!(child.wait(true).unwrap(), Wait::Done { code: 0, .. }));
//! ```

pub mod cmdline;
pub mod envblock;

mod attr;
mod error;
mod group;
mod inherit;
mod launch;
mod process;
mod table;

pub use attr::{Attributes, Blocking, CommandKind, ErrorFn, StdioMode, Stream};
pub use error::{Error, Result};
pub use launch::launch;
pub use process::{ExitReason, Process, Wait, WaitAll, wait_all};
