//! Runtime settings read from `SUBPROCD_*` environment variables.
//!
//! The daemon takes no command-line arguments; everything tunable lives
//! here. Invalid values are logged and replaced by the default.

use std::env;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use subproc_protocol::STATUS_HEADER_LEN;
use tracing::warn;

pub const DEFAULT_CONTROL_FD: RawFd = 3;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
/// Keeps a status-3 frame within `PIPE_BUF` so it is written atomically.
pub const DEFAULT_READ_CHUNK: usize = 4096 - STATUS_HEADER_LEN;
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

const DEFAULT_TERMINATE_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGPWR,
];

const DEFAULT_CRASH_SIGNALS: &[Signal] = &[
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGSEGV,
    Signal::SIGSYS,
    Signal::SIGTRAP,
];

/// Catchable signals whose default action would end the daemon (plus a few
/// harmless ones). Whatever is neither terminate nor crash is caught and
/// discarded, so children still start with default handlers. Synchronous
/// faults the signal driver refuses (ILL, FPE, SEGV) are left out.
const IGNORABLE_SIGNALS: &[libc::c_int] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGSTKFLT,
    libc::SIGURG,
    libc::SIGXCPU,
    libc::SIGXFSZ,
    libc::SIGVTALRM,
    libc::SIGPROF,
    libc::SIGWINCH,
    libc::SIGIO,
    libc::SIGPWR,
    libc::SIGSYS,
];

fn ignorable_signals() -> impl Iterator<Item = libc::c_int> {
    IGNORABLE_SIGNALS
        .iter()
        .copied()
        .chain(libc::SIGRTMIN()..=libc::SIGRTMAX())
}

/// Signals that can never be configured.
const RESERVED_SIGNALS: &[Signal] = &[Signal::SIGKILL, Signal::SIGSTOP, Signal::SIGCHLD];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPolicy {
    pub terminate: Vec<Signal>,
    pub crash: Vec<Signal>,
    /// Raw numbers: real-time signals have no [`Signal`] variant.
    pub dropped: Vec<libc::c_int>,
}

impl SignalPolicy {
    pub fn new(terminate: Vec<Signal>, crash: Vec<Signal>) -> Self {
        let terminate: Vec<Signal> = terminate
            .into_iter()
            .filter(|sig| !crash.contains(sig))
            .collect();
        let dropped = ignorable_signals()
            .filter(|signo| {
                !terminate
                    .iter()
                    .chain(&crash)
                    .any(|sig| *sig as libc::c_int == *signo)
            })
            .collect();
        Self {
            terminate,
            crash,
            dropped,
        }
    }
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_TERMINATE_SIGNALS.to_vec(),
            DEFAULT_CRASH_SIGNALS.to_vec(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub control_fd: RawFd,
    pub kill_grace: Duration,
    pub read_chunk: usize,
    pub max_payload: usize,
    pub signals: SignalPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_fd: DEFAULT_CONTROL_FD,
            kill_grace: DEFAULT_KILL_GRACE,
            read_chunk: DEFAULT_READ_CHUNK,
            max_payload: DEFAULT_MAX_PAYLOAD,
            signals: SignalPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let control_fd = parse_var(&lookup, "SUBPROCD_CONTROL_FD", |fd: &RawFd| *fd >= 0)
            .unwrap_or(defaults.control_fd);
        let kill_grace = parse_var(&lookup, "SUBPROCD_KILL_GRACE_MS", |_: &u64| true)
            .map(Duration::from_millis)
            .unwrap_or(defaults.kill_grace);
        let read_chunk = parse_var(&lookup, "SUBPROCD_READ_CHUNK", |n: &usize| *n > 0)
            .unwrap_or(defaults.read_chunk);
        let max_payload = parse_var(&lookup, "SUBPROCD_MAX_PAYLOAD", |n: &usize| *n > 0)
            .unwrap_or(defaults.max_payload);

        let terminate = signal_var(&lookup, "SUBPROCD_TERMINATE_SIGNALS")
            .unwrap_or_else(|| defaults.signals.terminate.clone());
        let crash = signal_var(&lookup, "SUBPROCD_CRASH_SIGNALS")
            .unwrap_or_else(|| DEFAULT_CRASH_SIGNALS.to_vec());

        Self {
            control_fd,
            kill_grace,
            read_chunk,
            max_payload,
            signals: SignalPolicy::new(terminate, crash),
        }
    }
}

fn parse_var<T, F, V>(lookup: &F, key: &str, valid: V) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
    V: Fn(&T) -> bool,
{
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(_) => {
            warn!("Out-of-range {} value '{}'; using default", key, raw);
            None
        }
        Err(err) => {
            warn!("Invalid {} value '{}': {}", key, raw, err);
            None
        }
    }
}

fn signal_var<F>(lookup: &F, key: &str) -> Option<Vec<Signal>>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match parse_signal_list(&raw) {
        Ok(signals) => Some(signals),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", key, raw, err);
            None
        }
    }
}

/// Parses a comma separated list such as `HUP,SIGTERM, int`.
pub fn parse_signal_list(raw: &str) -> Result<Vec<Signal>, String> {
    let mut signals = Vec::new();
    for item in raw.split(',') {
        let name = item.trim().to_ascii_uppercase();
        if name.is_empty() {
            continue;
        }
        let full = if name.starts_with("SIG") {
            name
        } else {
            format!("SIG{}", name)
        };
        let signal =
            Signal::from_str(&full).map_err(|_| format!("unknown signal '{}'", item.trim()))?;
        if RESERVED_SIGNALS.contains(&signal) {
            return Err(format!("{} cannot be configured", signal.as_str()));
        }
        if !signals.contains(&signal) {
            signals.push(signal);
        }
    }
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_protocol_contract() {
        let settings = settings_from(&[]);
        assert_eq!(settings.control_fd, 3);
        assert_eq!(settings.kill_grace, Duration::from_secs(5));
        assert_eq!(settings.read_chunk + STATUS_HEADER_LEN, 4096);
        assert!(settings.signals.terminate.contains(&Signal::SIGTERM));
        assert!(settings.signals.terminate.contains(&Signal::SIGHUP));
        assert!(settings.signals.crash.contains(&Signal::SIGSEGV));
        assert!(settings.signals.dropped.contains(&libc::SIGUSR1));
        assert!(settings.signals.dropped.contains(&libc::SIGSTKFLT));
        assert!(settings.signals.dropped.contains(&libc::SIGRTMIN()));
        assert!(settings.signals.dropped.contains(&libc::SIGRTMAX()));
        assert!(!settings.signals.dropped.contains(&libc::SIGTERM));
        assert!(!settings.signals.dropped.contains(&libc::SIGABRT));
    }

    #[test]
    fn signals_outside_both_sets_are_dropped() {
        let settings = settings_from(&[
            ("SUBPROCD_TERMINATE_SIGNALS", "TERM"),
            ("SUBPROCD_CRASH_SIGNALS", "SEGV"),
        ]);
        let dropped = &settings.signals.dropped;
        assert!(dropped.contains(&libc::SIGHUP));
        assert!(dropped.contains(&libc::SIGABRT));
        assert!(!dropped.contains(&libc::SIGTERM));
        assert!(!dropped.contains(&libc::SIGSEGV));
        assert!(!dropped.contains(&libc::SIGCHLD));
        assert!(!dropped.contains(&libc::SIGTSTP));
    }

    #[test]
    fn environment_overrides_are_applied() {
        let settings = settings_from(&[
            ("SUBPROCD_CONTROL_FD", "7"),
            ("SUBPROCD_KILL_GRACE_MS", "250"),
            ("SUBPROCD_READ_CHUNK", "512"),
            ("SUBPROCD_TERMINATE_SIGNALS", "term, usr1"),
        ]);
        assert_eq!(settings.control_fd, 7);
        assert_eq!(settings.kill_grace, Duration::from_millis(250));
        assert_eq!(settings.read_chunk, 512);
        assert_eq!(
            settings.signals.terminate,
            vec![Signal::SIGTERM, Signal::SIGUSR1]
        );
        assert!(!settings.signals.dropped.contains(&libc::SIGUSR1));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let settings = settings_from(&[
            ("SUBPROCD_CONTROL_FD", "-4"),
            ("SUBPROCD_KILL_GRACE_MS", "soon"),
            ("SUBPROCD_READ_CHUNK", "0"),
            ("SUBPROCD_CRASH_SIGNALS", "SEGV,KILL"),
        ]);
        assert_eq!(settings.control_fd, DEFAULT_CONTROL_FD);
        assert_eq!(settings.kill_grace, DEFAULT_KILL_GRACE);
        assert_eq!(settings.read_chunk, DEFAULT_READ_CHUNK);
        assert_eq!(settings.signals.crash, DEFAULT_CRASH_SIGNALS.to_vec());
    }

    #[test]
    fn crash_membership_wins_over_terminate() {
        let policy = SignalPolicy::new(
            vec![Signal::SIGTERM, Signal::SIGABRT],
            vec![Signal::SIGABRT],
        );
        assert_eq!(policy.terminate, vec![Signal::SIGTERM]);
        assert_eq!(policy.crash, vec![Signal::SIGABRT]);
    }

    #[test]
    fn signal_lists_accept_both_spellings() {
        assert_eq!(
            parse_signal_list("SIGHUP,int,,Quit").unwrap(),
            vec![Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT]
        );
        assert!(parse_signal_list("NOPE").is_err());
        assert!(parse_signal_list("CHLD").is_err());
        assert!(parse_signal_list("").unwrap().is_empty());
    }
}
