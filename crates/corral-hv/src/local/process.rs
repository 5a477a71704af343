//! Spawning the domain process, with pipes or a pseudo-terminal.

use crate::driver::{ConsoleReader, ConsoleWriter};
use crate::spec::DomainSpec;
use nix::pty::{openpty, OpenptyResult, Winsize};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

/// Default terminal geometry for pty-backed processes.
const DEFAULT_WINSIZE: Winsize = Winsize {
    ws_row: 24,
    ws_col: 80,
    ws_xpixel: 0,
    ws_ypixel: 0,
};

/// The I/O endpoints of a spawned process, as seen from the host.
pub(crate) struct ProcessIo {
    /// Process stdin, `None` when not interactive or after a write failure.
    pub stdin: Option<ConsoleWriter>,
    /// Process stdout (or the pty master), `None` after EOF.
    pub stdout: Option<ConsoleReader>,
    /// Process stderr, `None` in pty mode or after EOF.
    pub stderr: Option<ConsoleReader>,
}

impl ProcessIo {
    /// All output streams reached EOF.
    pub fn drained(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }
}

/// Spawn `program args` configured from `spec`.
///
/// With `spec.tty` the child gets a new session whose controlling terminal
/// is the slave side of a fresh pty; stdout and stderr are merged through
/// the master. Otherwise plain pipes are used, and stdin is `/dev/null`
/// unless the spec is interactive.
pub(crate) fn spawn(program: &str, args: &[String], spec: &DomainSpec) -> io::Result<(Child, ProcessIo)> {
    let mut cmd = Command::new(program);
    cmd.args(args).envs(&spec.env).kill_on_drop(true);
    if let Some(dir) = &spec.workdir {
        cmd.current_dir(dir);
    }
    if let Some(uid) = spec.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = spec.gid {
        cmd.gid(gid);
    }

    if spec.tty {
        spawn_pty(cmd, spec.interactive)
    } else {
        spawn_piped(cmd, spec.interactive)
    }
}

fn spawn_piped(mut cmd: Command, interactive: bool) -> io::Result<(Child, ProcessIo)> {
    cmd.stdin(if interactive { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let io = ProcessIo {
        stdin: child
            .stdin
            .take()
            .map(|w| Box::new(w) as ConsoleWriter),
        stdout: child
            .stdout
            .take()
            .map(|r| Box::new(r) as ConsoleReader),
        stderr: child
            .stderr
            .take()
            .map(|r| Box::new(r) as ConsoleReader),
    };
    Ok((child, io))
}

fn spawn_pty(mut cmd: Command, interactive: bool) -> io::Result<(Child, ProcessIo)> {
    let OpenptyResult { master, slave } = openpty(Some(&DEFAULT_WINSIZE), None)
        .map_err(|e| io::Error::other(format!("openpty: {e}")))?;

    cmd.stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave.try_clone()?));

    // SAFETY: only async-signal-safe calls (setsid, ioctl) run between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::other)?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    // The parent must not keep slave descriptors open, or reads on the master
    // never report the hangup when the child exits.
    drop(cmd);
    drop(slave);

    let reader = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
    let stdin = if interactive {
        Some(Box::new(tokio::fs::File::from_std(std::fs::File::from(master))) as ConsoleWriter)
    } else {
        None
    };

    Ok((
        child,
        ProcessIo {
            stdin,
            stdout: Some(Box::new(reader)),
            stderr: None,
        },
    ))
}

/// Exit code of a finished process; death by signal `n` is `128 + n`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}
