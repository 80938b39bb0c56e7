//! The daemon's single event loop.
//!
//! One task multiplexes the control channel, child events, signals and the
//! supervisor's next timer. Every branch is handled to completion before
//! the loop waits again; reader, reaper and status writer tasks only ever
//! post [`ChildEvent`]s back here.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::sys::signal::Signal;
use subproc_protocol::{peek_tag, Frame, FrameError, OutputStream, SpawnRequest, StatusMessage};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::control::{ControlChannel, ControlEvent};
use crate::forwarder::spawn_forwarder;
use crate::launcher::{launch, Launched};
use crate::reaper::spawn_reaper;
use crate::settings::Settings;
use crate::signals::{SignalDisposition, SignalSource};
use crate::status::{report_once, StatusPipe, StatusWriter};
use crate::supervisor::{ChildEvent, KillSignaller, ShutdownTrigger, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Control channel closed and every child accounted for.
    Finished,
    /// A crash signal arrived; children were killed, the caller re-raises.
    Crashed(Signal),
}

/// Output messages a child may have queued but not yet written before its
/// forwarders stop reading.
const OUTPUT_BACKLOG: usize = 64;

pub struct Reactor {
    read_chunk: usize,
    kill_grace: Duration,
    control: Option<ControlChannel>,
    signals: SignalSource,
    supervisor: Supervisor<KillSignaller>,
    writers: JoinSet<()>,
    events_tx: UnboundedSender<ChildEvent>,
    events_rx: UnboundedReceiver<ChildEvent>,
}

async fn next_control(control: &mut Option<ControlChannel>) -> io::Result<ControlEvent> {
    match control.as_mut() {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

impl Reactor {
    /// Adopts the control descriptor and installs signal handling. Must be
    /// called inside the runtime.
    pub fn new(settings: Settings) -> Result<Self> {
        let control = ControlChannel::from_inherited(settings.control_fd, settings.max_payload)?;
        let signals = SignalSource::install(&settings.signals)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            read_chunk: settings.read_chunk,
            kill_grace: settings.kill_grace,
            control: Some(control),
            signals,
            supervisor: Supervisor::new(KillSignaller, settings.kill_grace),
            writers: JoinSet::new(),
            events_tx,
            events_rx,
        })
    }

    pub async fn run(mut self) -> Exit {
        info!("Serving control channel");
        loop {
            if self.control.is_none() && self.supervisor.is_empty() {
                info!("Control channel closed and no children left");
                self.flush_status().await;
                return Exit::Finished;
            }
            let deadline = self.supervisor.next_deadline();

            tokio::select! {
                event = next_control(&mut self.control) => self.on_control(event),
                Some(event) = self.events_rx.recv() => self.supervisor.handle(event),
                Some(joined) = self.writers.join_next(), if !self.writers.is_empty() => {
                    if let Err(err) = joined {
                        error!("Status writer task failed: {}", err);
                    }
                }
                disposition = self.signals.recv() => match disposition {
                    SignalDisposition::Terminate(signal) => {
                        info!(signal = signal.as_str(), "Termination signal received");
                        self.shutdown(ShutdownTrigger::Signal(signal));
                    }
                    SignalDisposition::Crash(signal) => {
                        error!(signal = signal.as_str(), "Crash signal received, killing all children");
                        self.supervisor.kill_all(Signal::SIGKILL);
                        return Exit::Crashed(signal);
                    }
                    SignalDisposition::Dropped(signo) => {
                        debug!(signo, "Ignoring signal");
                    }
                },
                _ = wait_until(deadline) => self.supervisor.on_deadline(Instant::now()),
            }
        }
    }

    /// Gives status writers one grace period to hand their last messages
    /// to readers.
    async fn flush_status(&mut self) {
        if self.writers.is_empty() {
            return;
        }
        let writers = &mut self.writers;
        let drained = tokio::time::timeout(self.kill_grace, async {
            while writers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                pending = self.writers.len(),
                "Abandoning status messages nobody is reading"
            );
        }
    }

    fn shutdown(&mut self, trigger: ShutdownTrigger) {
        if self.control.take().is_some() {
            debug!("Control channel dropped");
        }
        self.supervisor.begin_shutdown(trigger, Instant::now());
    }

    fn on_control(&mut self, event: io::Result<ControlEvent>) {
        match event {
            Ok(ControlEvent::Frame(frame)) => self.spawn(frame),
            Ok(ControlEvent::Malformed(err)) => self.reject(err),
            Ok(ControlEvent::Closed(partial)) => {
                if let Some(err) = partial {
                    self.reject(err);
                }
                info!(phase = ?self.supervisor.phase(), "Control channel closed");
                self.shutdown(ShutdownTrigger::ControlClosed);
            }
            Err(err) => {
                error!("Control channel read failed: {}", err);
                self.shutdown(ShutdownTrigger::ControlClosed);
            }
        }
    }

    fn spawn(&mut self, frame: Frame) {
        let Frame { payload, fds, .. } = frame;
        let request = match SpawnRequest::decode(&payload, fds.len()) {
            Ok(request) => request,
            Err(error) => return self.reject(FrameError { error, payload, fds }),
        };

        let launched = launch(&request, &fds);
        // Passed descriptors other than the status pipe close here; the
        // child holds its own duplicates.
        let Some(status_fd) = fds.into_iter().next() else {
            return;
        };
        let (mut status_pipe, writer) = StatusPipe::open(status_fd);

        match launched {
            Ok(launched) => self.track(request.tag, launched, status_pipe, writer),
            Err(err) => {
                warn!(tag = request.tag, errno = err.errno, "Spawn failed: {}", err);
                report_once(
                    &mut status_pipe,
                    &StatusMessage::spawn_failed(request.tag, err.errno, err.message),
                );
                self.writers.spawn(writer.run());
            }
        }
    }

    fn track(
        &mut self,
        tag: u32,
        launched: Launched,
        status_pipe: StatusPipe,
        writer: StatusWriter,
    ) {
        let streams = launched.forwarded_streams();
        let Launched {
            pid,
            child,
            stdout,
            stderr,
        } = launched;

        let id = self.supervisor.admit(tag, pid, Box::new(status_pipe), streams);
        let credit = Arc::new(Semaphore::new(OUTPUT_BACKLOG));
        self.writers.spawn(
            writer
                .with_credit(credit.clone())
                .reporting_to(id, self.events_tx.clone())
                .run(),
        );

        let chunk = self.read_chunk;
        if let Some(stdout) = stdout {
            let events = self.events_tx.clone();
            spawn_forwarder(id, OutputStream::Stdout, stdout, chunk, credit.clone(), events);
        }
        if let Some(stderr) = stderr {
            let events = self.events_tx.clone();
            spawn_forwarder(id, OutputStream::Stderr, stderr, chunk, credit, events);
        }
        spawn_reaper(id, pid, child, self.events_tx.clone());
    }

    /// Reports a rejected message on its status pipe when one came with it,
    /// otherwise on the diagnostic stream.
    fn reject(&mut self, err: FrameError) {
        let FrameError {
            error,
            payload,
            fds,
        } = err;
        let diagnostic = error.diagnostic();
        let tag = peek_tag(&payload).unwrap_or(0);
        match fds.into_iter().next() {
            Some(status_fd) => {
                warn!(tag, "Rejected request: {}", diagnostic);
                let (mut pipe, writer) = StatusPipe::open(status_fd);
                report_once(&mut pipe, &StatusMessage::malformed(tag, diagnostic));
                self.writers.spawn(writer.run());
            }
            None => error!("Discarded control message: {}", diagnostic),
        }
    }
}
