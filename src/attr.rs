//! Launch attributes: I/O redirection, working directory, command
//! interpretation, lifecycle flags, and credentials, accumulated through
//! setters and consumed by the launcher.

use crate::error::{Error, Result};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, OFlag, fcntl},
    unistd::pipe2,
};
use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
};

/// How the launcher interprets the program and argument input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandKind {
    /// Invoke the program directly, with the configured environment.
    #[default]
    Program,

    /// Invoke the program directly; the child inherits the caller's
    /// environment as-is and any configured block is ignored.
    ProgramEnv,

    /// Locate the program on the search path, with the caller's
    /// environment.
    ProgramPath,

    /// Hand the command line to the system interpreter, with the configured
    /// environment.
    ShellCommand,

    /// Hand the command line to the system interpreter; the child inherits
    /// the caller's environment.
    ShellCommandEnv,
}

/// Which ends of a redirection pipe block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Blocking {
    /// Both ends block.
    #[default]
    Full,

    /// Only the parent's end blocks.
    Parent,

    /// Only the child's end blocks.
    Child,

    /// Neither end blocks.
    None,
}

/// Redirection mode for one standard stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// The child shares the parent's descriptor.
    #[default]
    Inherit,

    /// The stream is piped to the parent.
    Pipe(Blocking),

    /// The stream is bound to the null device.
    Suppressed,
}

/// One of the three standard streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    /// Standard input.
    Stdin,

    /// Standard output.
    Stdout,

    /// Standard error.
    Stderr,
}
impl Stream {
    /// Position in the per-stream slot array; also the descriptor number.
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// The two ends of one configured redirection.
///
/// Either end may be absent: injection can hand over just a child end or
/// just a parent end. The child end transfers to the spawned process at the
/// single documented point in the launcher; the parent end moves into the
/// returned process record.
#[derive(Debug)]
pub(crate) struct PipeEndPair {
    /// The end the child will own, marked inheritable.
    pub child: Option<OwnedFd>,

    /// The end the parent retains, kept close-on-exec.
    pub parent: Option<OwnedFd>,
}

/// What a configured stream slot holds.
#[derive(Debug, Default)]
pub(crate) enum StdioSlot {
    /// No redirection; the child shares the parent's stream.
    #[default]
    Inherit,

    /// The null-device sentinel. Nothing is allocated; the child binds the
    /// stream to the null device itself.
    Null,

    /// An allocated or injected pipe.
    Pair(PipeEndPair),
}

/// Diagnostic callback: native code plus a human-readable description.
pub type ErrorFn = Box<dyn Fn(i32, &str) + Send + Sync + 'static>;

/// Mutable launch configuration, consumed by [`crate::launch`].
pub struct Attributes {
    /// Directory the child starts in; the parent's when unset.
    pub(crate) working_directory: Option<PathBuf>,

    /// Program/argument interpretation mode.
    pub(crate) command_kind: CommandKind,

    /// Per-stream redirection slots, indexed by [`Stream::index`].
    pub(crate) stdio: [StdioSlot; 3],

    /// Detach the child from the session.
    pub(crate) detached: bool,

    /// Bind the child to the process-wide kill group.
    pub(crate) autokill: bool,

    /// Restrict inheritance to the explicitly collected descriptors.
    pub(crate) constrain_handles: bool,

    /// Diagnostic side channel, invoked before structured errors return.
    pub(crate) error_callback: Option<ErrorFn>,

    /// Identity the child runs under, validated at set time.
    pub(crate) credential: Option<ident::Token>,
}

impl Attributes {
    /// Fresh attributes: direct program invocation, all streams inherited,
    /// no flags.
    pub fn new() -> Self {
        Self {
            working_directory: None,
            command_kind: CommandKind::default(),
            stdio: [StdioSlot::Inherit, StdioSlot::Inherit, StdioSlot::Inherit],
            detached: false,
            autokill: false,
            constrain_handles: false,
            error_callback: None,
            credential: None,
        }
    }

    /// Configure redirection for the three standard streams.
    ///
    /// Piped streams allocate their pipe here, with the parent end kept
    /// close-on-exec and the child end marked inheritable. Suppressed
    /// streams bind to the null-device sentinel without allocating.
    pub fn set_io(&mut self, stdin: StdioMode, stdout: StdioMode, stderr: StdioMode) -> Result<()> {
        self.stdio[Stream::Stdin.index()] = slot(Stream::Stdin, stdin)?;
        self.stdio[Stream::Stdout.index()] = slot(Stream::Stdout, stdout)?;
        self.stdio[Stream::Stderr.index()] = slot(Stream::Stderr, stderr)?;
        Ok(())
    }

    /// Inject pre-made descriptors for one stream instead of allocating a
    /// pipe. Both ends are duplicated, so the caller keeps its own; the
    /// child end's duplicate is forced inheritable.
    pub fn set_child_handle(
        &mut self,
        stream: Stream,
        child_end: Option<BorrowedFd>,
        parent_end: Option<BorrowedFd>,
    ) -> Result<()> {
        let child = match child_end {
            Some(fd) => {
                let dup = duplicate(fd)?;
                set_inheritable(dup.as_fd(), true)?;
                Some(dup)
            }
            None => None,
        };
        let parent = match parent_end {
            Some(fd) => Some(duplicate(fd)?),
            None => None,
        };

        self.stdio[stream.index()] = StdioSlot::Pair(PipeEndPair { child, parent });
        Ok(())
    }

    /// Set the directory the child starts in. The value is folded into the
    /// native form up front; a value the native call cannot take fails with
    /// [`Error::InvalidPath`].
    pub fn set_directory(&mut self, dir: &str) -> Result<()> {
        if dir.is_empty() || dir.as_bytes().contains(&0) {
            return Err(Error::InvalidPath(dir.into()));
        }
        self.working_directory = Some(pathfind::merge(None, dir));
        Ok(())
    }

    /// Set the program/argument interpretation mode.
    pub fn set_command_kind(&mut self, kind: CommandKind) -> Result<()> {
        self.command_kind = kind;
        Ok(())
    }

    /// Detach the child from the calling session.
    pub fn set_detached(&mut self, detached: bool) -> Result<()> {
        self.detached = detached;
        Ok(())
    }

    /// Bind the child (and its descendants) to the process-wide kill group
    /// at launch.
    pub fn set_autokill(&mut self, autokill: bool) -> Result<()> {
        self.autokill = autokill;
        Ok(())
    }

    /// Restrict the child to the explicitly collected descriptors,
    /// regardless of any other descriptor open in the process.
    pub fn set_constrain_handles(&mut self, constrain: bool) -> Result<()> {
        self.constrain_handles = constrain;
        Ok(())
    }

    /// Register the diagnostic callback.
    pub fn set_error_callback(&mut self, callback: ErrorFn) -> Result<()> {
        self.error_callback = Some(callback);
        Ok(())
    }

    /// Validate `identity` and hold its token for the launch.
    ///
    /// Validation happens here, not at launch: a failed logon reaches the
    /// caller before any pipe or process group exists. A second call while
    /// a credential is held fails with [`Error::AlreadySet`] and leaves the
    /// first intact.
    pub fn set_credential(&mut self, identity: &str, secret: Option<&str>) -> Result<()> {
        if self.credential.is_some() {
            let err = Error::AlreadySet;
            self.report(err.code(), &format!("credential already set; rejected: {identity}"));
            return Err(err);
        }

        let token = match ident::resolve(identity) {
            Ok(token) => token,
            Err(cause) => {
                let err = credential_error(cause);
                self.report(err.code(), &format!("identity validation failed on {identity}: {err}"));
                return Err(err);
            }
        };

        // Assuming an identity on this host is privilege-based; the secret
        // only matters to hosts that perform a logon, and is never stored.
        let _ = secret;

        self.credential = Some(token);
        Ok(())
    }

    /// Invoke the diagnostic callback, if one is registered.
    pub(crate) fn report(&self, code: i32, message: &str) {
        if let Some(callback) = &self.error_callback {
            callback(code, message);
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the slot for one stream from its requested mode.
fn slot(stream: Stream, mode: StdioMode) -> Result<StdioSlot> {
    match mode {
        StdioMode::Inherit => Ok(StdioSlot::Inherit),
        StdioMode::Suppressed => Ok(StdioSlot::Null),
        StdioMode::Pipe(blocking) => Ok(StdioSlot::Pair(make_pipe(stream, blocking)?)),
    }
}

/// Allocate the pipe for one stream and apply its blocking mode.
fn make_pipe(stream: Stream, blocking: Blocking) -> Result<PipeEndPair> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)?;

    // The child reads its input and writes its output, so stdin's child end
    // is the read side while the other streams transpose.
    let (child, parent) = match stream {
        Stream::Stdin => (read, write),
        Stream::Stdout | Stream::Stderr => (write, read),
    };

    match blocking {
        Blocking::Full => {}
        Blocking::Parent => set_nonblocking(child.as_fd())?,
        Blocking::Child => set_nonblocking(parent.as_fd())?,
        Blocking::None => {
            set_nonblocking(child.as_fd())?;
            set_nonblocking(parent.as_fd())?;
        }
    }

    set_inheritable(child.as_fd(), true)?;
    Ok(PipeEndPair {
        child: Some(child),
        parent: Some(parent),
    })
}

/// Set or clear the inheritable state of a descriptor. Inheritable means
/// the close-on-exec flag is absent.
pub(crate) fn set_inheritable(fd: BorrowedFd, inheritable: bool) -> Result<()> {
    let mut flags = FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, !inheritable);
    let _ = fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Current descriptor flags; the snapshot the inheritance window restores.
pub(crate) fn descriptor_flags(fd: BorrowedFd) -> Result<FdFlag> {
    Ok(FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?))
}

/// Switch one pipe end to non-blocking I/O.
fn set_nonblocking(fd: BorrowedFd) -> Result<()> {
    let mut flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.insert(OFlag::O_NONBLOCK);
    let _ = fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Duplicate a caller-provided descriptor into launcher ownership.
fn duplicate(fd: BorrowedFd) -> Result<OwnedFd> {
    fd.try_clone_to_owned().map_err(|err| {
        Error::Os(err.raw_os_error().map_or(Errno::EIO, Errno::from_raw))
    })
}

/// Map an identity failure onto the launcher taxonomy: a refused or unknown
/// account is a failed logon.
fn credential_error(err: ident::Error) -> Error {
    match err {
        ident::Error::Os(errno) => Error::Os(errno),
        other => Error::PermissionDenied(other.to_string()),
    }
}
