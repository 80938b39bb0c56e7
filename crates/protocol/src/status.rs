//! Status messages written to a request's status pipe.

use std::io::{self, Read};

pub const STATUS_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// The control message was ill-formed. `value` is 0.
    Malformed = 0,
    /// The child could not be created. `value` is the errno.
    SpawnFailed = 1,
    /// The child is running. `value` is its pid.
    Spawned = 2,
    /// A chunk of forwarded output. `value` names the stream.
    Output = 3,
    /// A forwarded stream reached end-of-file. `value` names the stream.
    StreamClosed = 4,
    /// The child terminated. `value` is the raw wait status.
    Exited = 5,
}

impl StatusCode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => StatusCode::Malformed,
            1 => StatusCode::SpawnFailed,
            2 => StatusCode::Spawned,
            3 => StatusCode::Output,
            4 => StatusCode::StreamClosed,
            5 => StatusCode::Exited,
            _ => return None,
        })
    }
}

/// A forwarded output stream of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub const ALL: [OutputStream; 2] = [OutputStream::Stdout, OutputStream::Stderr];

    /// Descriptor number in the child, also the `value` of status-3/4.
    pub fn fd(&self) -> u32 {
        match self {
            OutputStream::Stdout => 1,
            OutputStream::Stderr => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub tag: u32,
    pub status: StatusCode,
    pub value: u32,
    pub payload: Vec<u8>,
}

impl StatusMessage {
    pub fn malformed(tag: u32, diagnostic: impl Into<String>) -> Self {
        Self::new(tag, StatusCode::Malformed, 0, diagnostic.into().into_bytes())
    }

    pub fn spawn_failed(tag: u32, errno: i32, message: impl Into<String>) -> Self {
        Self::new(
            tag,
            StatusCode::SpawnFailed,
            errno as u32,
            message.into().into_bytes(),
        )
    }

    pub fn spawned(tag: u32, pid: u32) -> Self {
        Self::new(tag, StatusCode::Spawned, pid, Vec::new())
    }

    pub fn output(tag: u32, stream: OutputStream, bytes: Vec<u8>) -> Self {
        Self::new(tag, StatusCode::Output, stream.fd(), bytes)
    }

    pub fn stream_closed(tag: u32, stream: OutputStream) -> Self {
        Self::new(tag, StatusCode::StreamClosed, stream.fd(), Vec::new())
    }

    pub fn exited(tag: u32, wait_status: i32, description: impl Into<String>) -> Self {
        Self::new(
            tag,
            StatusCode::Exited,
            wait_status as u32,
            description.into().into_bytes(),
        )
    }

    fn new(tag: u32, status: StatusCode, value: u32, payload: Vec<u8>) -> Self {
        Self {
            tag,
            status,
            value,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATUS_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.tag.to_ne_bytes());
        out.extend_from_slice(&(self.status as u32).to_ne_bytes());
        out.extend_from_slice(&self.value.to_ne_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_ne_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Reads one message. Returns `Ok(None)` on end-of-file at a message
    /// boundary.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut header = [0u8; STATUS_HEADER_LEN];
        let mut filled = 0;
        while filled < STATUS_HEADER_LEN {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "status pipe closed mid-header",
                    ))
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        let word = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&header[at..at + 4]);
            u32::from_ne_bytes(bytes)
        };
        let status = StatusCode::from_u32(word(4)).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown status code {}", word(4)),
            )
        })?;
        let mut payload = vec![0u8; word(12) as usize];
        reader.read_exact(&mut payload)?;

        Ok(Some(Self {
            tag: word(0),
            status,
            value: word(8),
            payload,
        }))
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
