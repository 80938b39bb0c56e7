//! subprocd wire protocol
//!
//! Spawn requests travel over the control channel as an 8-byte header plus a
//! payload carrying descriptors; every answer is a [`StatusMessage`] on the
//! status pipe passed with the request. All integers are 32-bit and in host
//! byte order.

pub mod error;
pub mod frame;
pub mod request;
pub mod status;

pub use error::{ErrorKind, ProtocolError};
pub use frame::{Frame, FrameAssembler, FrameError, Header, HEADER_LEN, MAX_DESCRIPTORS};
pub use request::{
    peek_tag, Disposition, Environment, SpawnRequest, DISPOSITION_INHERIT, ENV_INHERIT,
    REQUEST_FIXED_LEN, STATUS_PIPE_INDEX,
};
pub use status::{OutputStream, StatusCode, StatusMessage, STATUS_HEADER_LEN};
