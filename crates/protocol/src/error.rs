use thiserror::Error;

/// Coarse classification reported to callers and used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedHeader,
    MalformedPayload,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedHeader => "malformed header",
            ErrorKind::MalformedPayload => "malformed payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("control channel closed after {received} of 8 header bytes")]
    ShortHeader { received: usize },
    #[error("payload length {len} exceeds the {limit}-byte limit")]
    PayloadTooLarge { len: usize, limit: usize },
    #[error("control channel closed after {received} of {expected} payload bytes")]
    ShortPayload { received: usize, expected: usize },
    #[error("expected {expected} descriptors, received {received}")]
    DescriptorCount { expected: usize, received: usize },
    #[error("payload of {len} bytes is shorter than the 16-byte request header")]
    PayloadTooSmall { len: usize },
    #[error("no status pipe descriptor was passed")]
    NoStatusPipe,
    #[error("reserved flags must be zero, got {0:#04x}")]
    ReservedFlags(u8),
    #[error("invalid disposition {code:#04x} for fd {slot} with {n_fds} descriptors passed")]
    InvalidDisposition { slot: usize, code: u8, n_fds: usize },
    #[error("string table does not end with a NUL terminator")]
    UnterminatedString,
    #[error("string table holds {found} strings, expected {expected}")]
    StringCount { expected: u64, found: usize },
    #[error("environment entry {index} has no '='")]
    EnvironmentEntry { index: usize },
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::ShortHeader { .. } | ProtocolError::PayloadTooLarge { .. } => {
                ErrorKind::MalformedHeader
            }
            _ => ErrorKind::MalformedPayload,
        }
    }

    /// Text placed in a status-0 payload.
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.kind().as_str(), self)
    }
}
