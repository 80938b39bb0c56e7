//! Process table and termination orchestration.
//!
//! The supervisor is the single owner of every [`ProcessEntry`]. It never
//! performs I/O on its own initiative: the reactor feeds it [`ChildEvent`]s,
//! shutdown triggers and the current time, and it answers by writing status
//! messages and sending signals through the [`StatusSink`] and [`Signaller`]
//! seams. Timers are plain deadlines that the reactor sleeps on.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use subproc_protocol::{OutputStream, StatusMessage};
use tracing::{debug, info, warn};

use crate::reaper::describe_wait_status;
use crate::status::StatusSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

#[cfg(test)]
impl EntryId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Something observed about a child by its reader or reaper task.
#[derive(Debug)]
pub enum ChildEvent {
    Output {
        id: EntryId,
        stream: OutputStream,
        bytes: Vec<u8>,
    },
    StreamClosed {
        id: EntryId,
        stream: OutputStream,
    },
    Exited {
        id: EntryId,
        status: io::Result<i32>,
    },
    /// The entry's status writer hit a hard write error.
    StatusFailed {
        id: EntryId,
        error: io::Error,
    },
}

pub trait Signaller {
    fn signal(&mut self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// Delivers signals with `kill(2)`.
pub struct KillSignaller;

impl Signaller for KillSignaller {
    fn signal(&mut self, pid: u32, signal: Signal) -> io::Result<()> {
        kill(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Running,
    /// SIGTERM (or the triggering signal) sent, not yet reaped.
    Terminating,
    /// Wait status collected; the entry lingers until its streams close.
    Reaped,
}

pub struct ProcessEntry {
    tag: u32,
    pid: Option<u32>,
    /// `None` once a write failed: the entry is discarding.
    status_pipe: Option<Box<dyn StatusSink>>,
    open_streams: Vec<OutputStream>,
    state: EntryState,
    kill_deadline: Option<Instant>,
    exit_status: Option<io::Result<i32>>,
}

impl ProcessEntry {
    pub fn is_discarding(&self) -> bool {
        self.status_pipe.is_none()
    }

    fn is_live(&self) -> bool {
        self.state != EntryState::Reaped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Active,
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    ControlClosed,
    Signal(Signal),
}

impl ShutdownTrigger {
    fn signal(&self) -> Signal {
        match self {
            ShutdownTrigger::ControlClosed => Signal::SIGTERM,
            ShutdownTrigger::Signal(signal) => *signal,
        }
    }
}

struct GlobalShutdown {
    phase: ShutdownPhase,
    trigger: Option<ShutdownTrigger>,
    deadline: Option<Instant>,
}

pub struct Supervisor<K: Signaller> {
    entries: HashMap<EntryId, ProcessEntry>,
    next_id: u64,
    signaller: K,
    kill_grace: Duration,
    shutdown: GlobalShutdown,
}

fn signal_entry<K: Signaller>(signaller: &mut K, entry: &ProcessEntry, signal: Signal) {
    let Some(pid) = entry.pid else {
        return;
    };
    match signaller.signal(pid, signal) {
        Ok(()) => info!(tag = entry.tag, pid, signal = signal.as_str(), "Signalled child"),
        Err(err) if err.raw_os_error() == Some(Errno::ESRCH as i32) => {
            debug!(tag = entry.tag, pid, "Child already gone")
        }
        Err(err) => warn!(
            tag = entry.tag,
            pid,
            signal = signal.as_str(),
            "Failed to signal child: {}",
            err
        ),
    }
}

impl<K: Signaller> Supervisor<K> {
    pub fn new(signaller: K, kill_grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            signaller,
            kill_grace,
            shutdown: GlobalShutdown {
                phase: ShutdownPhase::Active,
                trigger: None,
                deadline: None,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.shutdown.phase
    }

    #[cfg(test)]
    pub fn entry(&self, id: EntryId) -> Option<&ProcessEntry> {
        self.entries.get(&id)
    }

    /// Registers a freshly launched child and announces it with status-2.
    pub fn admit(
        &mut self,
        tag: u32,
        pid: u32,
        status_pipe: Box<dyn StatusSink>,
        streams: Vec<OutputStream>,
    ) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            ProcessEntry {
                tag,
                pid: Some(pid),
                status_pipe: Some(status_pipe),
                open_streams: streams,
                state: EntryState::Running,
                kill_deadline: None,
                exit_status: None,
            },
        );
        info!(tag, pid, "Child started");
        self.emit(id, StatusMessage::spawned(tag, pid));
        id
    }

    pub fn handle(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Output { id, stream, bytes } => {
                let Some(entry) = self.entries.get(&id) else {
                    debug!(?id, "Output for a finalized entry dropped");
                    return;
                };
                if entry.is_discarding() || !entry.open_streams.contains(&stream) {
                    return;
                }
                let message = StatusMessage::output(entry.tag, stream, bytes);
                self.emit(id, message);
            }
            ChildEvent::StreamClosed { id, stream } => {
                let Some(entry) = self.entries.get_mut(&id) else {
                    return;
                };
                let before = entry.open_streams.len();
                entry.open_streams.retain(|open| *open != stream);
                if entry.open_streams.len() == before {
                    return;
                }
                let message = StatusMessage::stream_closed(entry.tag, stream);
                self.emit(id, message);
                self.try_finalize(id);
            }
            ChildEvent::Exited { id, status } => {
                let Some(entry) = self.entries.get_mut(&id) else {
                    return;
                };
                entry.state = EntryState::Reaped;
                entry.pid = None;
                entry.kill_deadline = None;
                entry.exit_status = Some(status);
                self.try_finalize(id);
            }
            ChildEvent::StatusFailed { id, error } => self.status_failed(id, error),
        }
    }

    /// Starts the daemon-wide graceful shutdown. Returns false if one is
    /// already under way.
    pub fn begin_shutdown(&mut self, trigger: ShutdownTrigger, now: Instant) -> bool {
        if self.shutdown.phase != ShutdownPhase::Active {
            debug!(
                ?trigger,
                initiated_by = ?self.shutdown.trigger,
                "Shutdown already in progress"
            );
            return false;
        }
        let signal = trigger.signal();
        info!(
            ?trigger,
            signal = signal.as_str(),
            children = self.entries.values().filter(|e| e.is_live()).count(),
            "Graceful shutdown initiated"
        );
        self.shutdown.phase = ShutdownPhase::Graceful;
        self.shutdown.trigger = Some(trigger);
        self.shutdown.deadline = Some(now + self.kill_grace);
        for entry in self.entries.values_mut().filter(|e| e.is_live()) {
            signal_entry(&mut self.signaller, entry, signal);
            entry.state = EntryState::Terminating;
        }
        true
    }

    /// Sends `signal` to every child not yet reaped.
    pub fn kill_all(&mut self, signal: Signal) {
        for entry in self.entries.values().filter(|e| e.is_live()) {
            signal_entry(&mut self.signaller, entry, signal);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.kill_deadline)
            .chain(self.shutdown.deadline)
            .min()
    }

    /// Fires every timer whose deadline is at or before `now`.
    pub fn on_deadline(&mut self, now: Instant) {
        for entry in self.entries.values_mut() {
            if entry.kill_deadline.is_some_and(|deadline| deadline <= now) {
                entry.kill_deadline = None;
                if entry.is_live() {
                    warn!(tag = entry.tag, pid = entry.pid, "Kill grace expired");
                    signal_entry(&mut self.signaller, entry, Signal::SIGKILL);
                }
            }
        }

        if self.shutdown.deadline.is_some_and(|deadline| deadline <= now) {
            self.shutdown.deadline = None;
            self.shutdown.phase = ShutdownPhase::Forced;
            warn!(
                survivors = self.entries.values().filter(|e| e.is_live()).count(),
                "Shutdown grace expired; killing remaining children"
            );
            self.kill_all(Signal::SIGKILL);
            let reaped: Vec<EntryId> = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.state == EntryState::Reaped)
                .map(|(id, _)| *id)
                .collect();
            for id in reaped {
                self.try_finalize(id);
            }
        }
    }

    /// Queues a message on the entry's status pipe, switching it to discard
    /// mode on failure.
    fn emit(&mut self, id: EntryId, message: StatusMessage) {
        let Some(pipe) = self
            .entries
            .get_mut(&id)
            .and_then(|entry| entry.status_pipe.as_mut())
        else {
            return;
        };
        if let Err(err) = pipe.deliver(&message) {
            self.status_failed(id, err);
        }
    }

    /// Stops writing to the entry's status pipe and escalates against its
    /// child, independently of any global shutdown.
    fn status_failed(&mut self, id: EntryId, err: io::Error) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.status_pipe.take().is_none() {
            return;
        }
        warn!(
            tag = entry.tag,
            pid = entry.pid,
            "Status pipe write failed, discarding further messages: {}",
            err
        );
        if entry.state == EntryState::Running {
            signal_entry(&mut self.signaller, entry, Signal::SIGTERM);
            entry.state = EntryState::Terminating;
            entry.kill_deadline = Some(Instant::now() + self.kill_grace);
        }
    }

    /// Emits status-5 and drops the entry once it is reaped and all its
    /// forwarded streams are closed. After the forced phase starts, streams
    /// still held open by someone else are closed on the child's behalf.
    fn try_finalize(&mut self, id: EntryId) {
        let forced = self.shutdown.phase == ShutdownPhase::Forced;
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if entry.state != EntryState::Reaped || (!entry.open_streams.is_empty() && !forced) {
            return;
        }

        let tag = entry.tag;
        let abandoned = entry.open_streams.clone();
        for stream in abandoned {
            debug!(tag, stream = stream.as_str(), "Abandoning open stream");
            self.emit(id, StatusMessage::stream_closed(tag, stream));
        }

        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        let message = match entry.exit_status.take() {
            Some(Ok(raw)) => StatusMessage::exited(entry.tag, raw, describe_wait_status(raw)),
            Some(Err(err)) => StatusMessage::exited(entry.tag, 0, format!("wait failed: {}", err)),
            None => return,
        };
        info!(
            tag = entry.tag,
            "Child finished: {}",
            String::from_utf8_lossy(&message.payload)
        );
        if let Some(pipe) = entry.status_pipe.as_mut() {
            if let Err(err) = pipe.deliver(&message) {
                warn!(tag = entry.tag, "Failed to queue exit status: {}", err);
            }
        }
    }
}
