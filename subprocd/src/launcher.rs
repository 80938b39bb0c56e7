//! Process launcher.
//!
//! Every descriptor the daemon holds is close-on-exec, so the child ends up
//! with exactly its three standard descriptors remapped per disposition.
//! Passed descriptors are duplicated for the child and the originals stay
//! with the caller of [`launch`], which drops them once the child exists.

use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::{Command as StdCommand, Stdio};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use subproc_protocol::{Disposition, Environment, OutputStream, SpawnRequest};
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command as TokioCommand};
use tracing::{debug, warn};

/// Marks every descriptor above stderr that the daemon inherited as
/// close-on-exec, so children only see what a request hands them.
pub fn seal_inherited_descriptors() {
    let entries = match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Cannot list inherited descriptors: {}", err);
            return;
        }
    };
    let fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|fd| *fd > 2)
        .collect();
    for fd in fds {
        // EBADF for the directory handle read_dir already closed.
        let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
    }
}

/// Creation failure reported as status-1.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LaunchError {
    pub errno: i32,
    pub message: String,
}

impl LaunchError {
    fn from_io(context: &OsStr, err: &io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        Self {
            errno,
            message: format!(
                "{}: {}",
                context.to_string_lossy(),
                Errno::from_i32(errno).desc()
            ),
        }
    }
}

pub struct Launched {
    pub pid: u32,
    pub child: Child,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl Launched {
    pub fn forwarded_streams(&self) -> Vec<OutputStream> {
        let mut streams = Vec::with_capacity(2);
        if self.stdout.is_some() {
            streams.push(OutputStream::Stdout);
        }
        if self.stderr.is_some() {
            streams.push(OutputStream::Stderr);
        }
        streams
    }
}

/// `execve` semantics: no `PATH` lookup, a bare name is relative to the
/// working directory.
fn exec_path(program: &OsStr) -> OsString {
    if program.is_empty() || program.as_bytes().contains(&b'/') {
        program.to_os_string()
    } else {
        let mut path = OsString::from("./");
        path.push(program);
        path
    }
}

extern "C" {
    static mut environ: *const *const libc::c_char;
}

/// A replaced environment as a ready `envp` array: request order and
/// duplicate names preserved, which `Command::env` would not do.
struct ExactEnvironment {
    _entries: Vec<CString>,
    envp: Vec<*const libc::c_char>,
}

// SAFETY: `envp` only points into `_entries`, which is owned, never mutated
// and outlives every use of the pointers.
unsafe impl Send for ExactEnvironment {}
unsafe impl Sync for ExactEnvironment {}

impl ExactEnvironment {
    fn new(entries: &[OsString]) -> io::Result<Self> {
        let entries = entries
            .iter()
            .map(|entry| CString::new(entry.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut envp: Vec<*const libc::c_char> = entries.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());
        Ok(Self {
            _entries: entries,
            envp,
        })
    }

    /// Called in the forked child right before `exec`, which then passes
    /// `environ` on unchanged.
    fn install(&self) {
        // SAFETY: the child is single-threaded after fork and this is a
        // plain pointer store.
        unsafe { environ = self.envp.as_ptr() };
    }
}

fn stdio_for(disposition: Disposition, fds: &[OwnedFd]) -> io::Result<Stdio> {
    Ok(match disposition {
        Disposition::Inherit => Stdio::inherit(),
        Disposition::Null => Stdio::null(),
        Disposition::Forward => Stdio::piped(),
        Disposition::Passed(index) => {
            let fd = fds
                .get(index)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
            Stdio::from(fd.try_clone()?)
        }
    })
}

fn build_command(request: &SpawnRequest, fds: &[OwnedFd]) -> io::Result<StdCommand> {
    let mut command = StdCommand::new(exec_path(&request.program));
    if let Some((argv0, rest)) = request.argv.split_first() {
        command.arg0(argv0);
        command.args(rest);
    }

    if let Environment::Replace(entries) = &request.env {
        let exact = ExactEnvironment::new(entries)?;
        // SAFETY: the hook only stores a pointer, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                exact.install();
                Ok(())
            });
        }
    }

    let [stdin, stdout, stderr] = request.stdio;
    command.stdin(stdio_for(stdin, fds)?);
    command.stdout(stdio_for(stdout, fds)?);
    command.stderr(stdio_for(stderr, fds)?);
    Ok(command)
}

/// Starts the child described by `request`. Must run inside the reactor's
/// runtime so the child is registered for reaping.
pub fn launch(request: &SpawnRequest, fds: &[OwnedFd]) -> Result<Launched, LaunchError> {
    let command = build_command(request, fds)
        .map_err(|err| LaunchError::from_io(OsStr::new("descriptor setup"), &err))?;

    let mut child = TokioCommand::from(command)
        .kill_on_drop(false)
        .spawn()
        .map_err(|err| LaunchError::from_io(&request.program, &err))?;
    let pid = child.id().ok_or_else(|| LaunchError {
        errno: libc::ECHILD,
        message: format!(
            "{}: child exited before its pid was known",
            request.program.to_string_lossy()
        ),
    })?;

    debug!(
        tag = request.tag,
        pid,
        program = %request.program.to_string_lossy(),
        argc = request.argv.len(),
        "Spawned child"
    );
    Ok(Launched {
        pid,
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child,
    })
}
