//! The launcher: path resolution, command-line and environment-block
//! construction, the descriptor-inheritance window, credentialed spawning,
//! and post-spawn ownership transfer, in one linear sequence.

use crate::{
    attr::{Attributes, CommandKind, StdioSlot},
    cmdline, envblock,
    error::{Error, Result},
    group,
    inherit::{InheritGuard, LaunchLock},
    process::Process,
};
use log::trace;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{prctl, signal::Signal, wait::waitpid},
    unistd::{
        self, ForkResult, Pid, execv, execve, execvp, execvpe, fork, pipe2, setpgid, setsid,
    },
};
use std::{
    convert::Infallible,
    ffi::CString,
    fs::File,
    io::Read,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
};

/// The concrete exec target once interpreter policy has been applied.
struct ExecPlan {
    /// The program the native call executes.
    program: String,

    /// Arguments after the program, argv0 excluded.
    args: Vec<String>,

    /// The full command line, recorded on the process for diagnostics.
    invoked: String,

    /// Whether the exec primitive performs the search-path lookup.
    search: bool,
}

/// Launch `program` with `args` under the configuration in `attrs`.
///
/// `env` holds the child's environment as `NAME=VALUE` strings; `None`, and
/// the environment-inheriting command kinds, hand the child the caller's
/// environment instead of building a block.
///
/// A failure before the native spawn leaves nothing running, and the
/// attributes keep every pipe they allocated for retry or cleanup. On
/// success the child-side pipe ends transfer to the child and the
/// parent-side ends move into the returned [`Process`]. The one failure
/// possible after a successful spawn is kill-group assignment: it is
/// returned as an error, but the child stays alive and is not torn down —
/// callers must treat that error as "maybe running, ownership was not
/// established".
pub fn launch(
    program: &str,
    args: &[&str],
    env: Option<&[&str]>,
    attrs: &mut Attributes,
) -> Result<Process> {
    let kind = attrs.command_kind;

    // Quotes on the raw input defeat resolution; the quoting layer puts
    // them back where needed.
    let raw = cmdline::strip_quotes(program);
    let resolved = resolve_program(raw, kind, attrs);

    let line = cmdline::build_command_line(&resolved, args);

    let shell_kind = matches!(kind, CommandKind::ShellCommand | CommandKind::ShellCommandEnv);
    let script = !shell_kind && cmdline::is_script(&resolved);

    let plan = if shell_kind || script {
        let shell = interpreter(attrs)?;
        let payload = if script {
            // The argument vector is untrusted on this path; everything,
            // the quoting layer's own quotes included, is made literal.
            cmdline::shell_escape(&line)
        } else if cmdline::legacy_interpreter(&shell) {
            cmdline::join_unquoted(&resolved, args)
        } else {
            line.clone()
        };
        ExecPlan {
            invoked: cmdline::build_command_line(&shell, &["-c", &payload]),
            program: shell,
            args: vec!["-c".to_owned(), payload],
            search: false,
        }
    } else {
        ExecPlan {
            invoked: line.clone(),
            program: resolved.clone(),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            search: kind == CommandKind::ProgramPath,
        }
    };

    let inherit_env =
        env.is_none() || matches!(kind, CommandKind::ProgramEnv | CommandKind::ShellCommandEnv);
    let envp = if inherit_env {
        None
    } else {
        let vars = env.unwrap_or(&[]);
        let block = envblock::build(vars).inspect_err(|err| {
            if let Error::Encoding(entry) = err {
                attrs.report(err.code(), &format!("cannot encode environment entry: {entry}"));
            }
        })?;
        Some(envblock::entries(&block))
    };

    let prog_c = to_cstring(&plan.program, attrs)?;
    let mut argv_c = Vec::with_capacity(plan.args.len() + 1);
    argv_c.push(to_cstring(&plan.program, attrs)?);
    for arg in &plan.args {
        argv_c.push(to_cstring(arg, attrs)?);
    }

    // An exec failure in the child travels back over this as a raw errno;
    // a successful exec closes it.
    let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC)?;

    trace!("{}", plan.invoked);

    let lock = LaunchLock::acquire();
    let mut inherit = InheritGuard::new();
    for slot in &attrs.stdio {
        if let StdioSlot::Pair(pair) = slot
            && let Some(child_end) = &pair.child
        {
            inherit.mark(child_end.as_fd())?;
        }
    }

    let impersonation = match &attrs.credential {
        Some(token) => Some(token.impersonate().map_err(|cause| {
            let err = match cause {
                ident::Error::Os(errno) => Error::Os(errno),
                other => Error::PermissionDenied(other.to_string()),
            };
            attrs.report(err.code(), "failed to impersonate the configured credential");
            err
        })?),
        None => None,
    };

    let child = match unsafe { fork() } {
        Err(errno) => {
            drop(impersonation);
            drop(inherit);
            drop(lock);
            return Err(Error::Os(errno));
        }
        Ok(ForkResult::Child) => {
            // Exec never returns; any setup failure is reported as a raw
            // errno before the child vanishes.
            let errno = match run_child(
                attrs,
                plan.search,
                &prog_c,
                &argv_c,
                envp.as_deref(),
                inherit.list(),
                status_write.as_raw_fd(),
            ) {
                Ok(never) => match never {},
                Err(errno) => errno,
            };
            let _ = unistd::write(&status_write, &(errno as i32).to_ne_bytes());
            unsafe { nix::libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => child,
    };

    // Impersonation reverts and the altered flags restore here, spawn
    // outcome notwithstanding.
    drop(impersonation);
    drop(inherit);
    drop(lock);

    // The parent's copy of the write end must go, or the read below never
    // sees EOF.
    drop(status_write);

    if let Some(errno) = read_exec_status(status_read) {
        // The child is already gone; reap it so nothing dangles.
        let _ = waitpid(child, None);
        attrs.report(errno as i32, &format!("failed to execute {}", plan.program));
        return Err(Error::Os(errno));
    }

    // Ownership transfer: the child's ends belong to the child, the
    // parent's ends ride on the process record. Suppressed and inherited
    // slots keep their configuration.
    let mut streams: [Option<File>; 3] = [None, None, None];
    for (slot, stream) in attrs.stdio.iter_mut().zip(streams.iter_mut()) {
        match std::mem::take(slot) {
            StdioSlot::Pair(pair) => {
                drop(pair.child);
                *stream = pair.parent.map(File::from);
            }
            other => *slot = other,
        }
    }
    let [stdin, stdout, stderr] = streams;

    let process = Process::new(child, plan.invoked, stdin, stdout, stderr);

    if attrs.autokill {
        // Both sides put the child in its group; whichever runs first wins
        // the fork/exec race.
        let _ = setpgid(child, child);
        if let Err(errno) = group::assign(child) {
            // The child stays alive: supervision was never established, and
            // tearing it down is not this layer's call.
            attrs.report(errno as i32, "failed to assign the child to the kill group");
            return Err(Error::Os(errno));
        }
    }

    Ok(process)
}

/// Normalize the program path for the built command line and, for the
/// direct kinds, for the exec itself.
fn resolve_program(raw: &str, kind: CommandKind, attrs: &Attributes) -> String {
    match kind {
        CommandKind::Program | CommandKind::ProgramEnv => {
            pathfind::merge(attrs.working_directory.as_deref(), raw)
                .to_string_lossy()
                .into_owned()
        }
        CommandKind::ProgramPath => match pathfind::resolve(raw) {
            Ok(path) => path.to_string_lossy().into_owned(),
            // The exec primitive performs the real search; this resolution
            // only feeds the recorded line.
            Err(_) => raw.to_owned(),
        },
        CommandKind::ShellCommand | CommandKind::ShellCommandEnv => {
            // Normalization only; the name may be a shell built-in and does
            // not have to resolve to anything.
            pathfind::merge(None, raw).to_string_lossy().into_owned()
        }
    }
}

/// Locate the system command interpreter: `$SHELL` when set, the system
/// shell otherwise. A quoted value from the environment is stripped.
fn interpreter(attrs: &Attributes) -> Result<String> {
    let named = std::env::var("SHELL").unwrap_or_default();
    let named = cmdline::strip_quotes(named.trim());
    let candidate = if named.is_empty() { "/bin/sh" } else { named };

    match pathfind::resolve(candidate).or_else(|_| pathfind::resolve("/bin/sh")) {
        Ok(path) => Ok(path.to_string_lossy().into_owned()),
        Err(cause) => {
            let err = Error::InvalidArgument("the system interpreter is not available".into());
            attrs.report(err.code(), &format!("cannot resolve the system interpreter: {cause}"));
            Err(err)
        }
    }
}

/// Encode one launch string, reporting and naming it on failure.
fn to_cstring(s: &str, attrs: &Attributes) -> Result<CString> {
    CString::new(s).map_err(|_| {
        let err = Error::Encoding(s.into());
        attrs.report(err.code(), &format!("cannot encode for the native call: {s}"));
        err
    })
}

/// Wait for the child's exec verdict: `None` when the descriptor closed
/// clean (the exec happened), the raw errno when it did not.
fn read_exec_status(fd: OwnedFd) -> Option<Errno> {
    let mut file = File::from(fd);
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled = filled.saturating_add(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    (filled == buf.len()).then(|| Errno::from_raw(i32::from_ne_bytes(buf)))
}

/// Everything between fork and exec, on the child's side.
fn run_child(
    attrs: &mut Attributes,
    search: bool,
    prog: &CString,
    argv: &[CString],
    envp: Option<&[CString]>,
    inherit_list: &[RawFd],
    status_fd: RawFd,
) -> std::result::Result<Infallible, Errno> {
    // Wire the standard streams first; everything else depends on them.
    for index in 0..attrs.stdio.len() {
        match std::mem::take(&mut attrs.stdio[index]) {
            StdioSlot::Inherit => {}
            StdioSlot::Null => {
                let null = open_null()?;
                redirect(index, null.as_fd())?;
            }
            StdioSlot::Pair(pair) => {
                // The parent's end has no business on this side.
                drop(pair.parent);
                if let Some(child_end) = pair.child {
                    redirect(index, child_end.as_fd())?;
                }
                // The original end closes here; its duplicate lives on as
                // the stream.
            }
        }
    }

    if attrs.constrain_handles {
        constrain(inherit_list, status_fd)?;
    }

    if attrs.detached {
        // A fresh session: no controlling terminal, its own group.
        let _ = setsid()?;
    } else if attrs.autokill {
        // Lead a group of one, so the kill group reaches descendants.
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    }

    if attrs.autokill {
        prctl::set_pdeathsig(Signal::SIGKILL)?;
    }

    if let Some(token) = &attrs.credential {
        token.adopt()?;
    }

    if let Some(dir) = &attrs.working_directory {
        unistd::chdir(dir.as_path())?;
    }

    let result = match (search, envp) {
        (true, Some(envp)) => execvpe(prog, argv, envp),
        (true, None) => execvp(prog, argv),
        (false, Some(envp)) => execve(prog, argv, envp),
        (false, None) => execv(prog, argv),
    };
    match result {
        Ok(never) => match never {},
        Err(errno) => Err(errno),
    }
}

/// Bind one standard stream to `fd`.
fn redirect(index: usize, fd: BorrowedFd) -> std::result::Result<(), Errno> {
    match index {
        0 => unistd::dup2_stdin(fd),
        1 => unistd::dup2_stdout(fd),
        _ => unistd::dup2_stderr(fd),
    }
}

/// The null device, opened fresh for this child.
fn open_null() -> std::result::Result<File, Errno> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|err| err.raw_os_error().map_or(Errno::EIO, Errno::from_raw))
}

/// Close every descriptor the explicit inherit list does not justify. With
/// nothing to inherit at all, inheritance is off entirely: the standard
/// streams are rebound to the null device and everything else goes.
fn constrain(list: &[RawFd], status_fd: RawFd) -> std::result::Result<(), Errno> {
    if list.is_empty() {
        let null = open_null()?;
        for index in 0..3 {
            redirect(index, null.as_fd())?;
        }
    }

    let limit = unsafe { nix::libc::sysconf(nix::libc::_SC_OPEN_MAX) };
    let limit = if limit <= 0 { 1024 } else { limit as RawFd };
    for fd in 3..limit {
        // The status pipe closes itself at exec.
        if fd != status_fd {
            let _ = unsafe { nix::libc::close(fd) };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attr::{Blocking, StdioMode},
        inherit::LaunchLock,
        process::{ExitReason, Wait},
    };
    use anyhow::Result;
    use std::io::Write;

    #[test]
    fn true_exits_clean() -> Result<()> {
        let mut attrs = Attributes::new();
        let mut child = launch("/bin/true", &[], None, &mut attrs)?;
        assert!(matches!(
            child.wait(true)?,
            Wait::Done { code: 0, reason: ExitReason::Exited }
        ));
        Ok(())
    }

    #[test]
    fn false_exit_code_comes_back() -> Result<()> {
        let mut attrs = Attributes::new();
        let mut child = launch("/bin/false", &[], None, &mut attrs)?;
        assert!(matches!(
            child.wait(true)?,
            Wait::Done { code: 1, reason: ExitReason::Exited }
        ));
        Ok(())
    }

    #[test]
    fn missing_program_fails_and_keeps_pipes() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_io(
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Suppressed,
        )?;

        let result = launch("/no/such/program", &[], None, &mut attrs);
        assert!(matches!(result, Err(Error::Os(Errno::ENOENT))));

        // The attributes still own their pipes; a retry with a real program
        // uses them.
        let mut child = launch("/bin/cat", &["-"], None, &mut attrs)?;
        child.stdin().unwrap().write_all(b"retry")?;
        child.close_stdin();
        let mut echoed = String::new();
        let _ = child.stdout().unwrap().read_to_string(&mut echoed)?;
        assert_eq!(echoed, "retry");
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn search_path_kind_finds_bare_names() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_command_kind(CommandKind::ProgramPath)?;
        let mut child = launch("true", &[], None, &mut attrs)?;
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn shell_command_round_trips_quoting() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_command_kind(CommandKind::ShellCommand)?;
        attrs.set_io(
            StdioMode::Inherit,
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Suppressed,
        )?;

        let mut child = launch("echo", &["one two", "three"], None, &mut attrs)?;
        let mut out = String::new();
        let _ = child.stdout().unwrap().read_to_string(&mut out)?;
        // The interpreter re-splits the built line; the quoted token
        // survives as a single argument.
        assert_eq!(out.trim(), "one two three");
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn constructed_environment_reaches_the_child() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_command_kind(CommandKind::ShellCommand)?;
        attrs.set_io(
            StdioMode::Inherit,
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Suppressed,
        )?;

        let mut child = launch("echo", &["$GREETING"], Some(&["GREETING=hello"]), &mut attrs)?;
        let mut out = String::new();
        let _ = child.stdout().unwrap().read_to_string(&mut out)?;
        assert_eq!(out.trim(), "hello");
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn environment_kind_inherits_the_caller() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_command_kind(CommandKind::ShellCommandEnv)?;
        attrs.set_io(
            StdioMode::Inherit,
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Suppressed,
        )?;

        // PATH is set in any test environment; the block argument is
        // ignored for the inheriting kinds.
        let mut child = launch("echo", &["$PATH"], Some(&["PATH="]), &mut attrs)?;
        let mut out = String::new();
        let _ = child.stdout().unwrap().read_to_string(&mut out)?;
        assert!(!out.trim().is_empty());
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn working_directory_applies() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_command_kind(CommandKind::ShellCommand)?;
        attrs.set_directory("/tmp")?;
        attrs.set_io(
            StdioMode::Inherit,
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Suppressed,
        )?;

        let mut child = launch("pwd", &[], None, &mut attrs)?;
        let mut out = String::new();
        let _ = child.stdout().unwrap().read_to_string(&mut out)?;
        assert_eq!(out.trim(), "/tmp");
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn fault_class_termination_classified_as_signaled() -> Result<()> {
        let mut attrs = Attributes::new();
        let mut child = launch("/bin/sleep", &["30"], None, &mut attrs)?;
        assert!(matches!(child.wait(false)?, Wait::Running));

        child.signal(Signal::SIGKILL)?;
        match child.wait(true)? {
            Wait::Done { code, reason } => {
                assert_eq!(reason, ExitReason::Signaled);
                assert_eq!(code, Signal::SIGKILL as i32);
            }
            other => panic!("expected termination, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn second_terminal_wait_is_an_error() -> Result<()> {
        let mut attrs = Attributes::new();
        let mut child = launch("/bin/true", &[], None, &mut attrs)?;
        assert!(matches!(child.wait(true)?, Wait::Done { .. }));
        assert!(matches!(child.wait(true), Err(Error::AlreadyWaited)));
        assert!(matches!(child.wait(false), Err(Error::AlreadyWaited)));
        Ok(())
    }

    #[test]
    fn autokill_children_join_the_group() -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.set_autokill(true)?;
        let mut child = launch("/bin/true", &[], None, &mut attrs)?;
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn credentialed_launch_as_self() -> Result<()> {
        let me = nix::unistd::User::from_uid(nix::unistd::Uid::effective())?
            .expect("calling user must exist")
            .name;

        let mut attrs = Attributes::new();
        attrs.set_credential(&me, None)?;
        attrs.set_command_kind(CommandKind::ShellCommand)?;
        attrs.set_io(
            StdioMode::Inherit,
            StdioMode::Pipe(Blocking::Full),
            StdioMode::Suppressed,
        )?;

        let mut child = launch("id", &["-u"], None, &mut attrs)?;
        let mut out = String::new();
        let _ = child.stdout().unwrap().read_to_string(&mut out)?;
        assert_eq!(out.trim(), nix::unistd::Uid::effective().to_string());
        assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
        Ok(())
    }

    #[test]
    fn window_is_balanced_across_success_and_failure() -> Result<()> {
        let mut attrs = Attributes::new();
        let mut ok = launch("/bin/true", &[], None, &mut attrs)?;
        let _ = ok.wait(true)?;
        assert!(launch("/no/such/program", &[], None, &mut attrs).is_err());

        // Launches on other test threads hold the window transiently; give
        // the counters a moment to settle.
        for _ in 0..200 {
            let (acquired, released) = LaunchLock::balance();
            if acquired == released {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (acquired, released) = LaunchLock::balance();
        assert_eq!(acquired, released);
        Ok(())
    }

    #[test]
    fn concurrent_autokill_launches_share_one_group() -> Result<()> {
        let threads: Vec<_> = (0..6)
            .map(|_| {
                std::thread::spawn(|| -> Result<()> {
                    let mut attrs = Attributes::new();
                    attrs.set_autokill(true)?;
                    let mut child = launch("/bin/true", &[], None, &mut attrs)?;
                    assert!(matches!(child.wait(true)?, Wait::Done { code: 0, .. }));
                    Ok(())
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("launch thread panicked")?;
        }
        Ok(())
    }
}
