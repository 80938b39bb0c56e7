//! Signal intake for the reactor.
//!
//! Terminate and dropped signals go through tokio's signal driver. Crash
//! signals cannot (tokio refuses SIGSEGV and friends) and get a one-shot
//! `sigaction` handler that writes the signal number to a self-pipe.

use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error};

use crate::settings::SignalPolicy;

/// Write end of the crash self-pipe, `-1` until installed.
static CRASH_PIPE: AtomicI32 = AtomicI32::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Terminate(Signal),
    Crash(Signal),
    /// Raw number, since real-time signals are included.
    Dropped(libc::c_int),
}

pub struct SignalSource {
    streams: StreamMap<libc::c_int, SignalStream>,
    terminate: Vec<Signal>,
    crash_pipe: Option<UnixStream>,
}

extern "C" fn on_crash_signal(signo: libc::c_int) {
    let fd = CRASH_PIPE.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = signo as u8;
    // SAFETY: write(2) and errno access are async-signal-safe.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *errno = saved;
    }
}

fn install_crash_handlers(signals: &[Signal]) -> Result<UnixStream> {
    let (reader, writer) = StdUnixStream::pair().context("failed to create crash self-pipe")?;
    reader.set_nonblocking(true)?;
    writer.set_nonblocking(true)?;
    // The write end lives for the rest of the process.
    CRASH_PIPE.store(writer.into_raw_fd(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(on_crash_signal),
        SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in signals {
        // SAFETY: the handler only touches an atomic and calls write(2).
        unsafe { sigaction(*sig, &action) }
            .with_context(|| format!("failed to install handler for {:?}", sig))?;
    }
    UnixStream::from_std(reader).context("failed to register crash self-pipe")
}

async fn next_crash(pipe: &mut Option<UnixStream>) -> Option<Signal> {
    let Some(reader) = pipe.as_mut() else {
        return std::future::pending().await;
    };
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).await {
        Ok(1) => Signal::try_from(byte[0] as i32).ok(),
        Ok(_) => {
            *pipe = None;
            None
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => None,
        Err(err) => {
            error!("Crash self-pipe failed: {}", err);
            *pipe = None;
            None
        }
    }
}

impl SignalSource {
    /// Must be called inside the runtime.
    pub fn install(policy: &SignalPolicy) -> Result<Self> {
        let mut streams = StreamMap::new();
        let terminate = policy.terminate.iter().map(|sig| *sig as libc::c_int);
        for signo in terminate.chain(policy.dropped.iter().copied()) {
            let stream = signal(SignalKind::from_raw(signo))
                .with_context(|| format!("failed to register signal {}", signo))?;
            streams.insert(signo, SignalStream::new(stream));
        }
        let crash_pipe = if policy.crash.is_empty() {
            None
        } else {
            Some(install_crash_handlers(&policy.crash)?)
        };
        debug!(
            terminate = ?policy.terminate,
            crash = ?policy.crash,
            dropped = ?policy.dropped,
            "Signal handlers installed"
        );
        Ok(Self {
            streams,
            terminate: policy.terminate.clone(),
            crash_pipe,
        })
    }

    /// Waits for the next delivered signal. Cancel safe.
    pub async fn recv(&mut self) -> SignalDisposition {
        loop {
            tokio::select! {
                Some((signo, ())) = self.streams.next() => {
                    let terminate = self.terminate.iter().find(|sig| **sig as libc::c_int == signo);
                    return match terminate {
                        Some(sig) => SignalDisposition::Terminate(*sig),
                        None => SignalDisposition::Dropped(signo),
                    };
                }
                crash = next_crash(&mut self.crash_pipe) => {
                    if let Some(sig) = crash {
                        return SignalDisposition::Crash(sig);
                    }
                }
            }
        }
    }
}

/// Re-delivers `signal` with its default action so the daemon dies the way
/// it would have without a handler.
pub fn reraise(signal: Signal) -> ! {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: restoring the default disposition.
    if let Err(err) = unsafe { sigaction(signal, &default) } {
        error!("Failed to restore default action for {:?}: {}", signal, err);
    }
    let mut mask = SigSet::empty();
    mask.add(signal);
    let _ = mask.thread_unblock();
    let _ = raise(signal);
    std::process::abort()
}
