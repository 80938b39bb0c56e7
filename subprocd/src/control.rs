//! Control channel reader.
//!
//! The channel is a stream socket inherited at a fixed descriptor. Every
//! read asks for at most [`FrameAssembler::remaining`] bytes so one receive
//! never straddles two messages, which keeps descriptors attached to the
//! message they were sent with.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::cmsg_space;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use subproc_protocol::{Frame, FrameAssembler, FrameError, MAX_DESCRIPTORS};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// Upper bound of a single receive; large payloads take several.
const RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
pub enum ControlEvent {
    Frame(Frame),
    Malformed(FrameError),
    /// The peer closed the channel. Carries the error for a message that was
    /// cut short, if any.
    Closed(Option<FrameError>),
}

pub struct ControlChannel {
    fd: AsyncFd<OwnedFd>,
    assembler: FrameAssembler,
    buf: Vec<u8>,
}

impl ControlChannel {
    /// Takes ownership of the inherited control descriptor. Must be called
    /// inside the runtime.
    pub fn from_inherited(raw: RawFd, max_payload: usize) -> Result<Self> {
        fcntl(raw, FcntlArg::F_GETFD)
            .with_context(|| format!("control channel descriptor {} is not open", raw))?;
        // SAFETY: the descriptor is open and nothing else in the process owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Self::new(fd, max_payload)
    }

    pub fn new(fd: OwnedFd, max_payload: usize) -> Result<Self> {
        let raw = fd.as_raw_fd();
        fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .context("failed to mark control channel close-on-exec")?;
        let flags = OFlag::from_bits_truncate(
            fcntl(raw, FcntlArg::F_GETFL).context("failed to read control channel flags")?,
        );
        fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
            .context("failed to make control channel non-blocking")?;

        Ok(Self {
            fd: AsyncFd::new(fd).context("failed to register control channel")?,
            assembler: FrameAssembler::new(max_payload),
            buf: vec![0u8; RECV_BUFFER],
        })
    }

    /// Waits for the next complete message, framing error or closure.
    ///
    /// Cancel safe: partial messages are kept in the assembler.
    pub async fn next_event(&mut self) -> io::Result<ControlEvent> {
        loop {
            let want = self.assembler.remaining().min(self.buf.len());
            let (n, fds) = self.recv_chunk(want).await?;
            if n == 0 {
                if !fds.is_empty() {
                    warn!(count = fds.len(), "Descriptors received without data");
                }
                debug!(idle = self.assembler.is_idle(), "Control channel reached end-of-file");
                return Ok(ControlEvent::Closed(self.assembler.finish()));
            }
            match self.assembler.push(&self.buf[..n], fds) {
                Some(Ok(frame)) => return Ok(ControlEvent::Frame(frame)),
                Some(Err(err)) => return Ok(ControlEvent::Malformed(err)),
                None => continue,
            }
        }
    }

    async fn recv_chunk(&mut self, want: usize) -> io::Result<(usize, Vec<OwnedFd>)> {
        let Self { fd, buf, .. } = self;
        loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| recv_with_fds(inner.get_ref().as_raw_fd(), &mut buf[..want])) {
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = cmsg_space!([RawFd; MAX_DESCRIPTORS]);
    let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC)
        .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us.
            fds.extend(
                received
                    .into_iter()
                    .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }),
            );
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        warn!("Control message truncated; some descriptors were lost");
    }
    Ok((msg.bytes, fds))
}
