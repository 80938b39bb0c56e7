//! Status pipe writers.
//!
//! The supervisor queues framed messages on a [`StatusPipe`]; one
//! [`StatusWriter`] task per pipe drains the queue, waiting for writability
//! whenever the reader falls behind. Only a hard write error (closed reader,
//! I/O failure) ends a writer early.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use subproc_protocol::{StatusCode, StatusMessage};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::supervisor::{ChildEvent, EntryId};

/// Destination of the status messages of one request.
pub trait StatusSink {
    /// Queues one framed message. An error means the destination already
    /// failed; the caller stops writing to this sink afterwards.
    fn deliver(&mut self, message: &StatusMessage) -> io::Result<()>;
}

struct Outbound {
    tag: u32,
    frame: Vec<u8>,
    output: bool,
}

/// Queue side of the status pipe passed as descriptor 0 of a spawn request.
pub struct StatusPipe {
    queue: UnboundedSender<Outbound>,
}

/// Owns the status descriptor and writes queued frames in order.
pub struct StatusWriter {
    target: Target,
    queue: UnboundedReceiver<Outbound>,
    credit: Option<Arc<Semaphore>>,
    owner: Option<(EntryId, UnboundedSender<ChildEvent>)>,
}

enum Target {
    Polled(AsyncFd<File>),
    /// Regular files and `/dev/null` cannot be registered with epoll; they
    /// never block either.
    Direct(File),
}

impl StatusPipe {
    /// Splits a status descriptor into its queue and its writer. Must be
    /// called inside the runtime.
    pub fn open(fd: OwnedFd) -> (StatusPipe, StatusWriter) {
        if let Err(err) = set_nonblocking(fd.as_raw_fd()) {
            warn!("Status pipe stays blocking: {}", err);
        }
        let file = File::from(fd);
        let target = match file.try_clone().and_then(AsyncFd::new) {
            Ok(polled) => Target::Polled(polled),
            Err(err) => {
                debug!("Status descriptor is not pollable, writing directly: {}", err);
                Target::Direct(file)
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = StatusWriter {
            target,
            queue: rx,
            credit: None,
            owner: None,
        };
        (StatusPipe { queue: tx }, writer)
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

impl StatusSink for StatusPipe {
    fn deliver(&mut self, message: &StatusMessage) -> io::Result<()> {
        let outbound = Outbound {
            tag: message.tag,
            frame: message.encode(),
            output: message.status == StatusCode::Output,
        };
        self.queue
            .send(outbound)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "status writer has stopped"))
    }
}

impl StatusWriter {
    /// Hands one permit back to `credit` for every output message written,
    /// and closes it when the writer stops.
    pub fn with_credit(mut self, credit: Arc<Semaphore>) -> Self {
        self.credit = Some(credit);
        self
    }

    /// Reports a failed write to the reactor instead of only logging it.
    pub fn reporting_to(mut self, id: EntryId, events: UnboundedSender<ChildEvent>) -> Self {
        self.owner = Some((id, events));
        self
    }

    /// Writes until every queue handle is dropped and the queue is empty,
    /// or until a write fails.
    pub async fn run(mut self) {
        while let Some(outbound) = self.queue.recv().await {
            if let Err(err) = self.target.write_frame(&outbound.frame).await {
                self.fail(outbound.tag, err);
                break;
            }
            if outbound.output {
                if let Some(credit) = &self.credit {
                    credit.add_permits(1);
                }
            }
        }
        if let Some(credit) = &self.credit {
            credit.close();
        }
    }

    fn fail(&mut self, tag: u32, err: io::Error) {
        self.queue.close();
        match self.owner.take() {
            Some((id, events)) => {
                let _ = events.send(ChildEvent::StatusFailed { id, error: err });
            }
            None => warn!(tag, "Failed to write status message: {}", err),
        }
    }
}

impl Target {
    async fn write_frame(&mut self, mut frame: &[u8]) -> io::Result<()> {
        let polled = match self {
            Target::Direct(file) => return file.write_all(frame),
            Target::Polled(polled) => polled,
        };
        while !frame.is_empty() {
            let mut guard = polled.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(frame)) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => frame = &frame[n..],
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

/// Reports the outcome of a request that never produced a process.
/// Failures are only logged: nothing else will be written to this sink.
pub fn report_once(sink: &mut dyn StatusSink, message: &StatusMessage) {
    if let Err(err) = sink.deliver(message) {
        warn!(
            tag = message.tag,
            status = message.status as u32,
            "Failed to queue status message: {}",
            err
        );
    }
}
