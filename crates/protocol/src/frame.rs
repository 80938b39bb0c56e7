//! Two-phase framing of the control channel.
//!
//! Every spawn request arrives as an 8-byte header (`data_len`, `n_fds`)
//! followed by `data_len` payload bytes that carry `n_fds` descriptors as
//! ancillary data. A stream socket may hand both parts over in arbitrary
//! pieces, so [`FrameAssembler`] keeps the partial state between reads.

use std::fmt;
use std::os::fd::OwnedFd;

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 8;

/// Kernel limit on descriptors per `SCM_RIGHTS` message.
pub const MAX_DESCRIPTORS: usize = 253;

/// Bytes of an oversized payload kept so its tag can still be reported.
const SALVAGE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub data_len: u32,
    pub n_fds: u32,
}

impl Header {
    pub fn new(data_len: u32, n_fds: u32) -> Self {
        Self { data_len, n_fds }
    }

    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = bytes;
        Self {
            data_len: u32::from_ne_bytes([a, b, c, d]),
            n_fds: u32::from_ne_bytes([e, f, g, h]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.data_len.to_ne_bytes());
        out[4..].copy_from_slice(&self.n_fds.to_ne_bytes());
        out
    }
}

/// A complete control message: payload bytes plus exactly `n_fds` descriptors.
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

/// A framing failure together with whatever was salvaged from the message.
///
/// `fds[0]`, when present, is the sender's status pipe and is where the
/// failure gets reported.
#[derive(Debug)]
pub struct FrameError {
    pub error: ProtocolError,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

enum Phase {
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    Payload {
        header: Header,
        buf: Vec<u8>,
        received: usize,
        oversized: bool,
    },
}

impl Phase {
    fn awaiting_header() -> Self {
        Phase::Header {
            buf: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

pub struct FrameAssembler {
    phase: Phase,
    fds: Vec<OwnedFd>,
    max_payload: usize,
}

impl FrameAssembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            phase: Phase::awaiting_header(),
            fds: Vec::new(),
            max_payload,
        }
    }

    /// Number of bytes the next read should ask for. Reading more than this
    /// would pull bytes of the following message into the current one.
    pub fn remaining(&self) -> usize {
        match &self.phase {
            Phase::Header { filled, .. } => HEADER_LEN - filled,
            Phase::Payload {
                header, received, ..
            } => header.data_len as usize - received,
        }
    }

    /// True when no part of a message has been received yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Header { filled: 0, .. }) && self.fds.is_empty()
    }

    /// Feed one read's worth of data. `bytes` must not exceed [`remaining`].
    ///
    /// Returns a result once a message is complete.
    ///
    /// [`remaining`]: FrameAssembler::remaining
    pub fn push(
        &mut self,
        bytes: &[u8],
        fds: Vec<OwnedFd>,
    ) -> Option<Result<Frame, FrameError>> {
        debug_assert!(bytes.len() <= self.remaining());
        self.fds.extend(fds);

        let mut input = bytes;
        if let Phase::Header { buf, filled } = &mut self.phase {
            let take = (HEADER_LEN - *filled).min(input.len());
            buf[*filled..*filled + take].copy_from_slice(&input[..take]);
            *filled += take;
            input = &input[take..];
            if *filled < HEADER_LEN {
                return None;
            }
            let header = Header::from_bytes(*buf);
            let len = header.data_len as usize;
            let oversized = len > self.max_payload;
            let buf = if oversized {
                Vec::with_capacity(SALVAGE_LEN)
            } else {
                Vec::with_capacity(len)
            };
            self.phase = Phase::Payload {
                header,
                buf,
                received: 0,
                oversized,
            };
        }

        if let Phase::Payload {
            header,
            buf,
            received,
            oversized,
        } = &mut self.phase
        {
            let expected = header.data_len as usize;
            let take = (expected - *received).min(input.len());
            if *oversized {
                let keep = SALVAGE_LEN.saturating_sub(buf.len()).min(take);
                buf.extend_from_slice(&input[..keep]);
            } else {
                buf.extend_from_slice(&input[..take]);
            }
            *received += take;
            if *received < expected {
                return None;
            }
        }

        Some(self.complete())
    }

    /// Called when the channel reports end-of-file. Returns the error for a
    /// message that was cut short, or `None` at a clean message boundary.
    pub fn finish(&mut self) -> Option<FrameError> {
        let phase = std::mem::replace(&mut self.phase, Phase::awaiting_header());
        let fds = std::mem::take(&mut self.fds);
        match phase {
            Phase::Header { filled: 0, .. } if fds.is_empty() => None,
            Phase::Header { filled, .. } => Some(FrameError {
                error: ProtocolError::ShortHeader { received: filled },
                payload: Vec::new(),
                fds,
            }),
            Phase::Payload {
                header,
                buf,
                received,
                ..
            } => Some(FrameError {
                error: ProtocolError::ShortPayload {
                    received,
                    expected: header.data_len as usize,
                },
                payload: buf,
                fds,
            }),
        }
    }

    fn complete(&mut self) -> Result<Frame, FrameError> {
        let phase = std::mem::replace(&mut self.phase, Phase::awaiting_header());
        let fds = std::mem::take(&mut self.fds);
        let Phase::Payload {
            header,
            buf,
            oversized,
            ..
        } = phase
        else {
            unreachable!("complete() is only reached from the payload phase");
        };

        if oversized {
            return Err(FrameError {
                error: ProtocolError::PayloadTooLarge {
                    len: header.data_len as usize,
                    limit: self.max_payload,
                },
                payload: buf,
                fds,
            });
        }
        if fds.len() != header.n_fds as usize {
            return Err(FrameError {
                error: ProtocolError::DescriptorCount {
                    expected: header.n_fds as usize,
                    received: fds.len(),
                },
                payload: buf,
                fds,
            });
        }
        Ok(Frame {
            header,
            payload: buf,
            fds,
        })
    }
}
