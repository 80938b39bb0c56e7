#![cfg(target_os = "linux")]

use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use subproc_protocol::{
    Disposition, Environment, Header, OutputStream, SpawnRequest, StatusCode, StatusMessage,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const FORWARD_BOTH: [Disposition; 3] = [Disposition::Null, Disposition::Forward, Disposition::Forward];

struct Daemon {
    child: Child,
    control: Option<UnixStream>,
}

impl Daemon {
    fn start() -> Self {
        Self::start_with(&[])
    }

    fn start_with(vars: &[(&str, &str)]) -> Self {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        let control_fd = theirs.as_raw_fd();

        let mut command = Command::new(env!("CARGO_BIN_EXE_subprocd"));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        for (key, value) in vars {
            command.env(key, value);
        }
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                let no_core = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if libc::setrlimit(libc::RLIMIT_CORE, &no_core) < 0 {
                    return Err(io::Error::last_os_error());
                }
                if control_fd == 3 {
                    let flags = libc::fcntl(3, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(control_fd, 3) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn().expect("spawn subprocd");
        drop(theirs);
        Self {
            child,
            control: Some(ours),
        }
    }

    fn control(&self) -> &UnixStream {
        self.control.as_ref().expect("control channel still open")
    }

    /// Sends header and payload in one message with `fds` attached.
    fn send(&self, payload: &[u8], fds: &[RawFd]) {
        let mut bytes = Header::new(payload.len() as u32, fds.len() as u32)
            .to_bytes()
            .to_vec();
        bytes.extend_from_slice(payload);
        let iov = [IoSlice::new(&bytes)];
        let rights = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
        let sent = sendmsg::<UnixAddr>(self.control().as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            .expect("sendmsg");
        assert_eq!(sent, bytes.len());
    }

    /// Sends `request` with a fresh status pipe plus `extra` descriptors and
    /// returns the reading end of the status pipe.
    fn spawn(&self, request: &SpawnRequest, extra: &[RawFd]) -> UnixStream {
        self.spawn_raw(&request.encode(), extra)
    }

    fn spawn_raw(&self, payload: &[u8], extra: &[RawFd]) -> UnixStream {
        let (reader, writer) = UnixStream::pair().expect("status socketpair");
        reader.set_read_timeout(Some(TIMEOUT)).expect("read timeout");
        let mut fds = vec![writer.as_raw_fd()];
        fds.extend_from_slice(extra);
        self.send(payload, &fds);
        reader
    }

    fn close_control(&mut self) {
        self.control = None;
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn wait(&mut self) -> ExitStatus {
        let started = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(started.elapsed() < TIMEOUT, "subprocd did not exit");
            sleep(Duration::from_millis(20));
        }
    }

    fn stderr(&mut self) -> String {
        let mut text = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            stderr.read_to_string(&mut text).expect("read stderr");
        }
        text
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn request(tag: u32, program: &str, argv: &[&str], stdio: [Disposition; 3]) -> SpawnRequest {
    SpawnRequest {
        tag,
        program: program.into(),
        argv: argv.iter().map(Into::into).collect(),
        env: Environment::Inherit,
        stdio,
    }
}

fn next(reader: &mut UnixStream) -> StatusMessage {
    StatusMessage::read_from(reader)
        .expect("read status message")
        .expect("status pipe closed early")
}

/// Reads until the daemon closes the status pipe.
fn drain(reader: &mut UnixStream) -> Vec<StatusMessage> {
    let mut messages = Vec::new();
    while let Some(message) = StatusMessage::read_from(reader).expect("read status message") {
        messages.push(message);
    }
    messages
}

fn output_of(messages: &[StatusMessage], stream: OutputStream) -> Vec<u8> {
    messages
        .iter()
        .filter(|m| m.status == StatusCode::Output && m.value == stream.fd())
        .flat_map(|m| m.payload.clone())
        .collect()
}

fn spawned_pid(reader: &mut UnixStream) -> Pid {
    let first = next(reader);
    assert_eq!(first.status, StatusCode::Spawned);
    Pid::from_raw(first.value as i32)
}

/// Polls until `pid` no longer exists.
fn wait_until_gone(pid: Pid) {
    let started = Instant::now();
    while kill(pid, None::<Signal>).is_ok() {
        assert!(started.elapsed() < TIMEOUT, "process {} is still running", pid);
        sleep(Duration::from_millis(20));
    }
}

fn position(messages: &[StatusMessage], status: StatusCode, value: u32) -> usize {
    messages
        .iter()
        .position(|m| m.status == status && m.value == value)
        .unwrap_or_else(|| panic!("no {:?}/{} in {:?}", status, value, messages))
}

#[test]
fn forwards_output_and_reports_exit_in_order() {
    let mut daemon = Daemon::start();
    let req = request(
        7,
        "/bin/sh",
        &["sh", "-c", "echo out; echo err >&2; exit 3"],
        FORWARD_BOTH,
    );
    let mut status = daemon.spawn(&req, &[]);

    let messages = drain(&mut status);
    assert!(messages.iter().all(|m| m.tag == 7));
    assert_eq!(messages[0].status, StatusCode::Spawned);
    assert!(messages[0].value > 0);

    let last = messages.last().expect("messages");
    assert_eq!(last.status, StatusCode::Exited);
    assert_eq!(last.value, 3 << 8);
    assert_eq!(last.payload_text(), "exited with status 3");

    assert_eq!(output_of(&messages, OutputStream::Stdout), b"out\n");
    assert_eq!(output_of(&messages, OutputStream::Stderr), b"err\n");
    let exit = messages.len() - 1;
    assert!(position(&messages, StatusCode::StreamClosed, 1) < exit);
    assert!(position(&messages, StatusCode::StreamClosed, 2) < exit);

    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn implicit_argv_and_empty_environment() {
    let mut daemon = Daemon::start();
    let mut payload = Vec::new();
    payload.extend_from_slice(&7u32.to_ne_bytes());
    payload.extend_from_slice(&[0, 0, 0, 0xFF]);
    payload.extend_from_slice(&0u32.to_ne_bytes());
    payload.extend_from_slice(&0u32.to_ne_bytes());
    payload.extend_from_slice(b"/bin/echo\0");
    let mut status = daemon.spawn_raw(&payload, &[]);

    let messages = drain(&mut status);
    let codes: Vec<StatusCode> = messages.iter().map(|m| m.status).collect();
    assert_eq!(
        codes,
        vec![
            StatusCode::Spawned,
            StatusCode::Output,
            StatusCode::StreamClosed,
            StatusCode::Exited
        ]
    );
    assert_eq!(messages[1].value, 1);
    assert_eq!(messages[1].payload, b"\n");
    assert_eq!(messages[2].value, 1);
    assert_eq!(messages[3].value, 0);

    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn replaced_environment_reaches_the_child() {
    let mut daemon = Daemon::start();
    let mut req = request(1, "/usr/bin/env", &["env"], FORWARD_BOTH);
    req.env = Environment::Replace(vec![
        "ZED=last".into(),
        "GREETING=hi there".into(),
        "ZED=again".into(),
    ]);
    let mut status = daemon.spawn(&req, &[]);

    let messages = drain(&mut status);
    assert_eq!(
        output_of(&messages, OutputStream::Stdout),
        b"ZED=last\nGREETING=hi there\nZED=again\n"
    );
    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn creation_failure_reports_errno() {
    let mut daemon = Daemon::start();
    let req = request(9, "/nonexistent/subprocd-test", &["x"], FORWARD_BOTH);
    let mut status = daemon.spawn(&req, &[]);

    let messages = drain(&mut status);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tag, 9);
    assert_eq!(messages[0].status, StatusCode::SpawnFailed);
    assert_eq!(messages[0].value, libc::ENOENT as u32);
    assert!(messages[0].payload_text().contains("No such file or directory"));

    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn malformed_requests_are_rejected_and_the_daemon_keeps_serving() {
    let mut daemon = Daemon::start();

    let mut payload = request(11, "/bin/true", &["true"], FORWARD_BOTH).encode();
    payload[4] = 0x01;
    let mut status = daemon.spawn_raw(&payload, &[]);
    let messages = drain(&mut status);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tag, 11);
    assert_eq!(messages[0].status, StatusCode::Malformed);
    assert_eq!(messages[0].value, 0);
    assert!(messages[0].payload_text().starts_with("malformed payload"));

    let mut payload = request(12, "/bin/true", &["true"], FORWARD_BOTH).encode();
    payload[6] = 5;
    let mut status = daemon.spawn_raw(&payload, &[]);
    let messages = drain(&mut status);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, StatusCode::Malformed);

    let mut status = daemon.spawn(&request(13, "/bin/true", &["true"], FORWARD_BOTH), &[]);
    let messages = drain(&mut status);
    assert_eq!(messages.first().map(|m| m.status), Some(StatusCode::Spawned));
    assert_eq!(messages.last().map(|m| m.status), Some(StatusCode::Exited));

    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn passed_descriptor_replaces_stdout() {
    let mut daemon = Daemon::start();
    let (mut ours, theirs) = UnixStream::pair().expect("socketpair");
    ours.set_read_timeout(Some(TIMEOUT)).expect("read timeout");
    let req = request(
        3,
        "/bin/echo",
        &["echo", "routed"],
        [Disposition::Null, Disposition::Passed(1), Disposition::Inherit],
    );
    let mut status = daemon.spawn(&req, &[theirs.as_raw_fd()]);
    drop(theirs);

    let codes: Vec<StatusCode> = drain(&mut status).iter().map(|m| m.status).collect();
    assert_eq!(codes, vec![StatusCode::Spawned, StatusCode::Exited]);

    let mut routed = String::new();
    ours.read_to_string(&mut routed).expect("read routed output");
    assert_eq!(routed, "routed\n");

    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn closing_the_control_channel_terminates_children() {
    let mut daemon = Daemon::start();
    let req = request(21, "/bin/sleep", &["sleep", "30"], FORWARD_BOTH);
    let mut status = daemon.spawn(&req, &[]);
    assert_eq!(next(&mut status).status, StatusCode::Spawned);

    daemon.close_control();
    let messages = drain(&mut status);
    let last = messages.last().expect("exit message");
    assert_eq!(last.status, StatusCode::Exited);
    assert_eq!(last.value, libc::SIGTERM as u32);
    assert_eq!(last.payload_text(), "killed by signal 15 (SIGTERM)");
    assert!(daemon.wait().success());
}

#[test]
fn stubborn_children_are_killed_after_the_grace_period() {
    let mut daemon = Daemon::start_with(&[("SUBPROCD_KILL_GRACE_MS", "200")]);
    let req = request(
        22,
        "/bin/sh",
        &["sh", "-c", "trap '' TERM; echo ready; while :; do sleep 1; done"],
        [Disposition::Null, Disposition::Forward, Disposition::Inherit],
    );
    let mut status = daemon.spawn(&req, &[]);
    assert_eq!(next(&mut status).status, StatusCode::Spawned);
    let ready = next(&mut status);
    assert_eq!(ready.status, StatusCode::Output);
    assert_eq!(ready.payload, b"ready\n");

    daemon.close_control();
    let messages = drain(&mut status);
    let last = messages.last().expect("exit message");
    assert_eq!(last.status, StatusCode::Exited);
    assert_eq!(ExitStatus::from_raw(last.value as i32).signal(), Some(libc::SIGKILL));
    assert!(daemon.wait().success());
}

#[test]
fn termination_signal_is_relayed_to_children() {
    let mut daemon = Daemon::start();
    let req = request(31, "/bin/sleep", &["sleep", "30"], FORWARD_BOTH);
    let mut status = daemon.spawn(&req, &[]);
    assert_eq!(next(&mut status).status, StatusCode::Spawned);

    kill(daemon.pid(), Signal::SIGTERM).expect("signal subprocd");
    let messages = drain(&mut status);
    let last = messages.last().expect("exit message");
    assert_eq!(last.status, StatusCode::Exited);
    assert_eq!(ExitStatus::from_raw(last.value as i32).signal(), Some(libc::SIGTERM));
    assert!(daemon.wait().success());
}

#[test]
fn truncated_header_is_reported_on_stderr() {
    let mut daemon = Daemon::start();
    daemon.control().write_all(&[1, 2, 3]).expect("write");
    daemon.close_control();

    assert!(daemon.wait().success());
    assert!(daemon.stderr().contains("malformed header"));
}

#[test]
fn message_without_status_pipe_is_discarded() {
    let mut daemon = Daemon::start();
    let payload = request(41, "/bin/true", &["true"], FORWARD_BOTH).encode();
    daemon.send(&payload, &[]);
    daemon.close_control();

    assert!(daemon.wait().success());
    assert!(daemon.stderr().contains("no status pipe descriptor was passed"));
}

#[test]
fn slow_status_reader_loses_nothing() {
    const TOTAL: usize = 4_000_000;
    let mut daemon = Daemon::start();
    let count = TOTAL.to_string();
    let req = request(
        51,
        "/usr/bin/head",
        &["head", "-c", &count, "/dev/zero"],
        [Disposition::Null, Disposition::Forward, Disposition::Inherit],
    );
    let mut status = daemon.spawn(&req, &[]);

    sleep(Duration::from_millis(1500));
    let messages = drain(&mut status);
    assert_eq!(output_of(&messages, OutputStream::Stdout).len(), TOTAL);
    let last = messages.last().expect("exit message");
    assert_eq!(last.status, StatusCode::Exited);
    assert_eq!(last.value, 0);

    daemon.close_control();
    assert!(daemon.wait().success());
}

#[test]
fn unrelated_signals_leave_the_daemon_running() {
    let mut daemon = Daemon::start();
    let req = request(52, "/bin/sleep", &["sleep", "30"], FORWARD_BOTH);
    let mut status = daemon.spawn(&req, &[]);
    assert_eq!(next(&mut status).status, StatusCode::Spawned);

    for signo in [libc::SIGSTKFLT, libc::SIGRTMIN(), libc::SIGRTMAX(), libc::SIGUSR1] {
        // SAFETY: plain kill(2) on our own child.
        assert_eq!(unsafe { libc::kill(daemon.pid().as_raw(), signo) }, 0);
    }
    sleep(Duration::from_millis(300));
    assert!(daemon.child.try_wait().expect("try_wait").is_none());

    let echo = request(53, "/bin/echo", &["echo", "still serving"], FORWARD_BOTH);
    let mut echo_status = daemon.spawn(&echo, &[]);
    assert_eq!(
        output_of(&drain(&mut echo_status), OutputStream::Stdout),
        b"still serving\n"
    );

    daemon.close_control();
    let last = drain(&mut status).pop().expect("exit message");
    assert_eq!(ExitStatus::from_raw(last.value as i32).signal(), Some(libc::SIGTERM));
    assert!(daemon.wait().success());
}

#[test]
fn crash_signal_kills_children_and_the_daemon() {
    // Orphans of the crashed daemon are re-parented here and can be reaped.
    // SAFETY: prctl with integer arguments only.
    assert_eq!(unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) }, 0);

    let mut daemon = Daemon::start();
    let req = request(61, "/bin/sleep", &["sleep", "30"], FORWARD_BOTH);
    let mut status = daemon.spawn(&req, &[]);
    let pid = spawned_pid(&mut status);

    kill(daemon.pid(), Signal::SIGABRT).expect("signal subprocd");
    assert_eq!(daemon.wait().signal(), Some(libc::SIGABRT));

    match waitpid(pid, None).expect("reap orphaned child") {
        WaitStatus::Signaled(_, signal, _) => assert_eq!(signal, Signal::SIGKILL),
        other => panic!("child ended with {:?}", other),
    }
}

#[test]
fn failed_status_pipe_terminates_only_its_child() {
    let mut daemon = Daemon::start_with(&[("SUBPROCD_KILL_GRACE_MS", "200")]);
    let chatty = request(
        71,
        "/bin/sh",
        &["sh", "-c", "while :; do echo tick; sleep 0.05; done"],
        [Disposition::Null, Disposition::Forward, Disposition::Inherit],
    );
    let mut chatty_status = daemon.spawn(&chatty, &[]);
    let chatty_pid = spawned_pid(&mut chatty_status);
    assert_eq!(next(&mut chatty_status).status, StatusCode::Output);

    let quiet = request(
        72,
        "/bin/sh",
        &["sh", "-c", "sleep 1; echo survived"],
        [Disposition::Null, Disposition::Forward, Disposition::Inherit],
    );
    let mut quiet_status = daemon.spawn(&quiet, &[]);
    assert_eq!(next(&mut quiet_status).status, StatusCode::Spawned);

    drop(chatty_status);
    wait_until_gone(chatty_pid);

    let messages = drain(&mut quiet_status);
    assert_eq!(output_of(&messages, OutputStream::Stdout), b"survived\n");
    let last = messages.last().expect("exit message");
    assert_eq!(last.status, StatusCode::Exited);
    assert_eq!(last.value, 0);

    daemon.close_control();
    assert!(daemon.wait().success());
}
