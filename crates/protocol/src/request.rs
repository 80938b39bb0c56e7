//! Spawn request payload layout.
//!
//! ```text
//! u32 tag | u8 flags | u8 fd0 | u8 fd1 | u8 fd2 | u32 argc | u32 envc
//! executable\0 argv[0]\0 .. argv[argc-1]\0 env[0]\0 .. env[envc-1]\0
//! ```

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::error::ProtocolError;

/// Length of the fixed-width part of a request payload.
pub const REQUEST_FIXED_LEN: usize = 16;

/// `envc` value meaning "inherit the daemon's environment".
pub const ENV_INHERIT: u32 = u32::MAX;

/// Disposition code meaning "inherit the daemon's descriptor".
pub const DISPOSITION_INHERIT: u8 = 0xFF;

/// Index of the status pipe among the passed descriptors.
pub const STATUS_PIPE_INDEX: usize = 0;

/// How one of the child's standard descriptors is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep whatever the daemon has on that slot.
    Inherit,
    /// fd 0 only: read from `/dev/null`.
    Null,
    /// fd 1/2 only: an internal pipe relayed as status-3 messages.
    Forward,
    /// Duplicate passed descriptor `k` (never the status pipe).
    Passed(usize),
}

impl Disposition {
    pub fn decode(slot: usize, code: u8, n_fds: usize) -> Result<Self, ProtocolError> {
        match code {
            DISPOSITION_INHERIT => Ok(Disposition::Inherit),
            0 if slot == 0 => Ok(Disposition::Null),
            0 => Ok(Disposition::Forward),
            k if (k as usize) < n_fds => Ok(Disposition::Passed(k as usize)),
            _ => Err(ProtocolError::InvalidDisposition { slot, code, n_fds }),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Disposition::Inherit => DISPOSITION_INHERIT,
            Disposition::Null | Disposition::Forward => 0,
            Disposition::Passed(k) => *k as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Inherit,
    /// Exactly these `KEY=VALUE` entries; empty means an empty environment.
    Replace(Vec<OsString>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub tag: u32,
    pub program: OsString,
    /// Full argument vector including `argv[0]`.
    pub argv: Vec<OsString>,
    pub env: Environment,
    pub stdio: [Disposition; 3],
}

/// Reads the tag of a payload that may be otherwise malformed.
pub fn peek_tag(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&payload[at..at + 4]);
    u32::from_ne_bytes(word)
}

impl SpawnRequest {
    /// Decodes a framed payload. `n_fds` counts every passed descriptor,
    /// the status pipe included.
    pub fn decode(payload: &[u8], n_fds: usize) -> Result<Self, ProtocolError> {
        if payload.len() < REQUEST_FIXED_LEN {
            return Err(ProtocolError::PayloadTooSmall { len: payload.len() });
        }
        if n_fds == 0 {
            return Err(ProtocolError::NoStatusPipe);
        }

        let tag = read_u32(payload, 0);
        let flags = payload[4];
        if flags != 0 {
            return Err(ProtocolError::ReservedFlags(flags));
        }
        let stdio = [
            Disposition::decode(0, payload[5], n_fds)?,
            Disposition::decode(1, payload[6], n_fds)?,
            Disposition::decode(2, payload[7], n_fds)?,
        ];
        let argc = read_u32(payload, 8);
        let envc = read_u32(payload, 12);

        let table = &payload[REQUEST_FIXED_LEN..];
        if !table.is_empty() && table.last() != Some(&0) {
            return Err(ProtocolError::UnterminatedString);
        }
        let mut strings: Vec<&[u8]> = if table.is_empty() {
            Vec::new()
        } else {
            table[..table.len() - 1].split(|b| *b == 0).collect()
        };

        let env_count = if envc == ENV_INHERIT { 0 } else { envc as u64 };
        let expected = 1 + argc as u64 + env_count;
        if strings.len() as u64 != expected {
            return Err(ProtocolError::StringCount {
                expected,
                found: strings.len(),
            });
        }

        let env_strings = strings.split_off(1 + argc as usize);
        let program = OsString::from_vec(strings[0].to_vec());
        let argv = if argc == 0 {
            vec![program.clone()]
        } else {
            strings[1..]
                .iter()
                .map(|s| OsString::from_vec(s.to_vec()))
                .collect()
        };

        let env = if envc == ENV_INHERIT {
            Environment::Inherit
        } else {
            let mut entries = Vec::with_capacity(env_strings.len());
            for (index, entry) in env_strings.into_iter().enumerate() {
                if !entry.contains(&b'=') {
                    return Err(ProtocolError::EnvironmentEntry { index });
                }
                entries.push(OsString::from_vec(entry.to_vec()));
            }
            Environment::Replace(entries)
        };

        Ok(Self {
            tag,
            program,
            argv,
            env,
            stdio,
        })
    }

    /// Encodes the payload half of a control message. `argc` is always
    /// written explicitly.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_FIXED_LEN + 64);
        out.extend_from_slice(&self.tag.to_ne_bytes());
        out.push(0);
        for disposition in &self.stdio {
            out.push(disposition.code());
        }
        out.extend_from_slice(&(self.argv.len() as u32).to_ne_bytes());
        let envc = match &self.env {
            Environment::Inherit => ENV_INHERIT,
            Environment::Replace(entries) => entries.len() as u32,
        };
        out.extend_from_slice(&envc.to_ne_bytes());

        let mut push_str = |s: &OsStr| {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        };
        push_str(&self.program);
        for arg in &self.argv {
            push_str(arg);
        }
        if let Environment::Replace(entries) = &self.env {
            for entry in entries {
                push_str(entry);
            }
        }
        out
    }
}
