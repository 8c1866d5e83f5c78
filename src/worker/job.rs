//! The job entity: one command execution request and its bookkeeping.

use std::os::fd::OwnedFd;

use chrono::{DateTime, Utc};

use super::scheduler::Handle;
use crate::codec::KvVec;

/// Worker-internal job key. The scheduler and the PID fanout refer to jobs
/// by token, never by reference, so ownership stays with the registry.
pub type JobToken = u64;

/// Jobs without a timeout (or with `timeout=0`) get this many seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 60;

/// Job supervision state.
///
/// `Stale` means the timeout response has already been sent but the child
/// refused to die (typically uninterruptible sleep); the job stays resident
/// until the kernel finally lets us reap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Stale,
}

/// Which output stream of the child a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutStream {
    Stdout,
    Stderr,
}

/// One captured output stream: the (possibly already closed) read end of
/// the child's pipe and everything gathered from it so far.
pub struct OutBuf {
    /// `None` once the descriptor is closed.
    pub fd: Option<OwnedFd>,
    pub buf: Vec<u8>,
}

impl OutBuf {
    fn new() -> Self {
        Self {
            fd: None,
            buf: Vec::new(),
        }
    }

    /// Truncate at the first NUL byte. The master protocol separates pairs
    /// with NULs, so embedded NULs in child output must not reach the wire.
    pub fn scrub_nul(&mut self) {
        if let Some(pos) = self.buf.iter().position(|&b| b == 0) {
            self.buf.truncate(pos);
        }
    }
}

/// One command execution request in flight.
pub struct Job {
    pub token: JobToken,
    /// Master-assigned id, echoed back; opaque to the worker.
    pub id: u32,
    pub command: String,
    /// Seconds until the job is killed.
    pub timeout: u32,
    /// The decoded request, retained for the response echo.
    pub request: KvVec,
    /// Child pid; 0 until spawned.
    pub pid: i32,
    pub outstd: OutBuf,
    pub outerr: OutBuf,
    /// Raw status word from wait(2); 0 until reaped.
    pub wait_status: i32,
    /// Resource usage snapshot taken at reap time.
    pub rusage: libc::rusage,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// This job's entry in the timeout scheduler.
    pub handle: Option<Handle>,
    pub state: JobState,
}

impl Job {
    /// Build a job from a decoded command frame.
    ///
    /// `command`, `job_id` and `timeout` are picked out of the vector;
    /// everything else rides along in `request` for the echo. Integers are
    /// parsed permissively (leading digits count, junk is ignored) and a
    /// missing or zero timeout gets the default.
    pub fn from_request(token: JobToken, request: KvVec) -> Self {
        let command = request
            .get_str(b"command")
            .map(|c| c.into_owned())
            .unwrap_or_default();
        let id = request.get(b"job_id").map(parse_u32_prefix).unwrap_or(0);
        let mut timeout = request.get(b"timeout").map(parse_u32_prefix).unwrap_or(0);
        if timeout == 0 {
            timeout = DEFAULT_TIMEOUT_SECS;
        }

        let now = Utc::now();
        Self {
            token,
            id,
            command,
            timeout,
            request,
            pid: 0,
            outstd: OutBuf::new(),
            outerr: OutBuf::new(),
            wait_status: 0,
            rusage: unsafe { std::mem::zeroed() },
            start: now,
            stop: now,
            handle: None,
            state: JobState::Active,
        }
    }

    pub fn out_mut(&mut self, which: OutStream) -> &mut OutBuf {
        match which {
            OutStream::Stdout => &mut self.outstd,
            OutStream::Stderr => &mut self.outerr,
        }
    }

    /// Scrub both captured buffers before they are put on the wire.
    pub fn scrub_nul_bytes(&mut self) {
        self.outstd.scrub_nul();
        self.outerr.scrub_nul();
    }
}

/// Permissive unsigned parse: consume leading ASCII digits, ignore the
/// rest. Empty or non-numeric input parses as 0.
fn parse_u32_prefix(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .saturating_mul(10)
            .saturating_add(u32::from(b - b'0'));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> KvVec {
        pairs.iter().map(|&(k, v)| (k, v)).collect()
    }

    #[test]
    fn test_from_request_basic() {
        let job = Job::from_request(
            1,
            request(&[
                ("command", "/bin/echo hi"),
                ("job_id", "7"),
                ("timeout", "10"),
            ]),
        );
        assert_eq!(job.command, "/bin/echo hi");
        assert_eq!(job.id, 7);
        assert_eq!(job.timeout, 10);
        assert_eq!(job.pid, 0);
        assert_eq!(job.state, JobState::Active);
        assert!(job.handle.is_none());
    }

    #[test]
    fn test_timeout_default_on_absent_or_zero() {
        let job = Job::from_request(1, request(&[("command", "x"), ("job_id", "1")]));
        assert_eq!(job.timeout, DEFAULT_TIMEOUT_SECS);

        let job = Job::from_request(
            2,
            request(&[("command", "x"), ("job_id", "1"), ("timeout", "0")]),
        );
        assert_eq!(job.timeout, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_missing_command_is_empty() {
        let job = Job::from_request(1, request(&[("job_id", "3")]));
        assert!(job.command.is_empty());
        assert_eq!(job.id, 3);
    }

    #[test]
    fn test_permissive_parse() {
        assert_eq!(parse_u32_prefix(b"42"), 42);
        assert_eq!(parse_u32_prefix(b"42abc"), 42);
        assert_eq!(parse_u32_prefix(b""), 0);
        assert_eq!(parse_u32_prefix(b"abc"), 0);
        assert_eq!(parse_u32_prefix(b"99999999999999999999"), u32::MAX);
    }

    #[test]
    fn test_scrub_nul() {
        let mut out = OutBuf::new();
        out.buf = b"abc\0def".to_vec();
        out.scrub_nul();
        assert_eq!(out.buf, b"abc");

        let mut out = OutBuf::new();
        out.buf = b"\0whatever".to_vec();
        out.scrub_nul();
        assert!(out.buf.is_empty());

        let mut out = OutBuf::new();
        out.buf = b"clean".to_vec();
        out.scrub_nul();
        assert_eq!(out.buf, b"clean");
    }
}
