// Child reaping and wait-status decoding.

use std::os::unix::process::ExitStatusExt;

use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::supervisor::{ChildEvent, EntryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
    Stopped(i32),
    Unknown(i32),
}

pub fn decode_wait_status(raw: i32) -> WaitOutcome {
    if libc::WIFEXITED(raw) {
        WaitOutcome::Exited(libc::WEXITSTATUS(raw))
    } else if libc::WIFSIGNALED(raw) {
        WaitOutcome::Signaled {
            signal: libc::WTERMSIG(raw),
            core_dumped: libc::WCOREDUMP(raw),
        }
    } else if libc::WIFSTOPPED(raw) {
        WaitOutcome::Stopped(libc::WSTOPSIG(raw))
    } else {
        WaitOutcome::Unknown(raw)
    }
}

fn signal_name(signal: i32) -> &'static str {
    Signal::try_from(signal)
        .map(|sig| sig.as_str())
        .unwrap_or("unknown signal")
}

/// Human-readable form carried in the status-5 payload.
pub fn describe_wait_status(raw: i32) -> String {
    match decode_wait_status(raw) {
        WaitOutcome::Exited(code) => format!("exited with status {}", code),
        WaitOutcome::Signaled {
            signal,
            core_dumped,
        } => format!(
            "killed by signal {} ({}){}",
            signal,
            signal_name(signal),
            if core_dumped { " (core dumped)" } else { "" }
        ),
        WaitOutcome::Stopped(signal) => {
            format!("stopped by signal {} ({})", signal, signal_name(signal))
        }
        WaitOutcome::Unknown(raw) => format!("unrecognized wait status {:#x}", raw),
    }
}

/// Waits for `child` on the reactor and reports its termination. Stops and
/// continues are not terminations and are never reported.
pub fn spawn_reaper(id: EntryId, pid: u32, mut child: Child, events: UnboundedSender<ChildEvent>) {
    tokio::spawn(async move {
        let status = child.wait().await.map(|status| status.into_raw());
        match &status {
            Ok(raw) => debug!(pid, "Child reaped: {}", describe_wait_status(*raw)),
            Err(err) => error!(pid, "waitpid failed: {}", err),
        }
        let _ = events.send(ChildEvent::Exited { id, status });
    });
}
