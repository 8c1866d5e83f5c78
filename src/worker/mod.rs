//! Worker lifecycle controller.
//!
//! A single-threaded, event-driven loop interleaves three asynchronous
//! sources: inbound command frames from the master, readiness on the
//! children's output pipes, and child-exit signals. A deadline-ordered
//! scheduler drives timeout enforcement. Every job is finalized (response
//! sent) exactly once and destroyed (resources released) exactly once;
//! stale jobs -- children that shrug off SIGKILL -- are finalized at
//! timeout and destroyed whenever the kernel finally releases them.

mod job;
mod mux;
mod registry;
mod scheduler;
mod spawn;
mod wait;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{self, sockopt};
use nix::unistd::Pid;

use crate::codec::{self, FrameReader, KvVec, ReadOutcome};
use crate::error::{Result, WorkerError};

use job::{Job, JobState, JobToken, OutStream};
use mux::{FdTag, IoMux};
use registry::JobRegistry;
use scheduler::TimeoutScheduler;
use wait::WaitOutcome;

/// Child-exit signals received but not yet processed. The handler does
/// nothing but increment; reaping happens on the loop thread after poll.
static REAPABLE: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_sigchld(_: libc::c_int) {
    REAPABLE.fetch_add(1, Ordering::Relaxed);
}

/// Poll slack so rounding never fires a timeout before its deadline.
const DEADLINE_SLACK_MS: i64 = 5;

/// Kernel send/receive buffer size for the master socket. Whole-frame
/// writes rely on this; there is no application-level write queue.
const MASTER_BUF_SIZE: usize = 256 * 1024;

/// Retry delay after a kill that failed to reap, before the job is stale.
const FIRST_RETRY_SECS: i64 = 1;

/// Retry delay for reaping an already-stale job.
const STALE_RETRY_SECS: i64 = 5;

/// Why a job is reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    TimedOut,
    Stale,
}

impl KillReason {
    /// Numeric sentinel for the response's `error_code`.
    fn error_code(self) -> i32 {
        match self {
            Self::TimedOut => Errno::ETIME as i32,
            Self::Stale => Errno::ESTALE as i32,
        }
    }
}

/// Outcome of draining one output descriptor.
struct GatherOutcome {
    /// The descriptor was closed; the caller should probe for completion
    /// unless this was the final drain.
    closed: bool,
    /// A read error other than EAGAIN/EINTR, reported on the log channel.
    error: Option<Errno>,
}

/// Adopt an inherited socket fd after checking it is actually open.
pub fn socket_from_fd(fd: RawFd) -> Result<OwnedFd> {
    if fd < 0 {
        return Err(WorkerError::BadSocketFd(fd));
    }
    let probe = unsafe { BorrowedFd::borrow_raw(fd) };
    nix::fcntl::fcntl(probe.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD)
        .map_err(|_| WorkerError::BadSocketFd(fd))?;
    // SAFETY: the fd is open and nothing else in this process owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The worker context: every process singleton lives here, constructed
/// once at startup and torn down by process exit.
pub struct Worker {
    master: OwnedFd,
    mux: IoMux,
    scheduler: TimeoutScheduler,
    registry: JobRegistry,
    ioc: FrameReader,
    next_token: JobToken,
    started: u32,
    running: u32,
    timeouts: u32,
}

impl Worker {
    /// Set up process state and wire the master socket into the loop.
    pub fn new(master: OwnedFd) -> Result<Self> {
        chdir_home();

        // Group leadership lets shutdown signal everything we spawned.
        let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));

        install_signal_handlers()?;

        set_cloexec(&std::io::stdout())?;
        set_cloexec(&std::io::stderr())?;
        set_sockopts(&master, MASTER_BUF_SIZE)?;

        let mut mux = IoMux::new();
        mux.register(master.as_raw_fd(), FdTag::Master);

        Ok(Self {
            master,
            mux,
            scheduler: TimeoutScheduler::new(),
            registry: JobRegistry::new(),
            ioc: FrameReader::new(),
            next_token: 1,
            started: 0,
            running: 0,
            timeouts: 0,
        })
    }

    /// The event loop. Runs until no descriptors remain registered or the
    /// master goes away.
    pub fn run(mut self) -> ! {
        tracing::info!("worker ready, entering event loop");
        while self.mux.len() > 0 {
            let poll_time = self.check_timeouts();

            let ready = match self.mux.poll(poll_time) {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    self.emergency_exit(1);
                }
            };

            for (_fd, tag) in ready {
                match tag {
                    FdTag::Master => self.receive_command(),
                    FdTag::JobStdout(token) => self.handle_job_io(token, OutStream::Stdout),
                    FdTag::JobStderr(token) => self.handle_job_io(token, OutStream::Stderr),
                }
            }

            if REAPABLE.load(Ordering::Relaxed) > 0 {
                self.reap_jobs();
            }

            // Loop-boundary invariants: every running job has exactly one
            // scheduler entry, and the registry owns exactly those jobs.
            debug_assert_eq!(self.running as usize, self.scheduler.len());
            debug_assert_eq!(self.registry.len(), self.scheduler.len());
        }
        std::process::exit(0);
    }

    /// Fire every due job and compute the next poll timeout in ms.
    /// `None` means wait indefinitely.
    fn check_timeouts(&mut self) -> Option<i32> {
        let mut poll_time = None;
        while self.running > 0 {
            let Some((handle, token)) = self.scheduler.peek() else {
                break;
            };
            let delta = (handle.deadline() - Utc::now()).num_milliseconds() + DEADLINE_SLACK_MS;
            if delta > 0 {
                poll_time = Some(delta.min(i32::MAX as i64) as i32);
                break;
            }

            let Some(state) = self.registry.get(token).map(|j| j.state) else {
                // A scheduler entry must always have a job behind it;
                // drop the orphan rather than spin on it.
                tracing::warn!(token, "scheduled entry without a job");
                self.scheduler.remove(&handle);
                continue;
            };
            match state {
                JobState::Active => self.kill_job(token, KillReason::TimedOut),
                JobState::Stale => self.kill_job(token, KillReason::Stale),
            }
        }
        poll_time
    }

    /// Master socket readiness: buffer inbound bytes, spawn a job per
    /// complete frame. A zero-length read means the master is gone.
    fn receive_command(&mut self) {
        match self.ioc.fill(&self.master) {
            ReadOutcome::Closed => {
                tracing::info!("master closed the connection, shutting down");
                self.mux.deregister(self.master.as_raw_fd());
                self.emergency_exit(0);
            }
            ReadOutcome::Failed(e) => {
                tracing::debug!(error = %e, "read from master failed");
            }
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Data(n) => {
                tracing::trace!(bytes = n, buffered = self.ioc.buffered(), "master data");
            }
        }

        while let Some(request) = self.ioc.next_frame() {
            self.spawn_job(request);
        }
    }

    /// Construct a job from a decoded request and start its child.
    fn spawn_job(&mut self, request: KvVec) {
        let token = self.next_token;
        self.next_token += 1;

        let mut job = Job::from_request(token, request);
        if job.command.is_empty() {
            let id = job.id;
            self.job_error(
                Some(id),
                job.request,
                format!("Failed to parse command line. Ignoring job {}", id),
            );
            return;
        }

        job.start = Utc::now();
        let deadline = job.start + chrono::Duration::seconds(i64::from(job.timeout));
        job.handle = Some(self.scheduler.add(deadline, token));
        self.started += 1;
        self.running += 1;

        match spawn::start_cmd(&mut job, &mut self.mux) {
            Ok(()) => {
                tracing::debug!(
                    job_id = job.id,
                    pid = job.pid,
                    timeout = job.timeout,
                    command = %job.command,
                    "spawned job"
                );
                let pid = job.pid;
                self.registry.insert(job);
                self.registry.index_pid(pid, token);
            }
            Err(e) => {
                if let Some(handle) = job.handle.take() {
                    self.scheduler.remove(&handle);
                }
                self.running -= 1;
                let id = job.id;
                self.job_error(Some(id), job.request, format!("Failed to start child: {}", e));
            }
        }
    }

    /// Readiness on one of a job's output pipes.
    fn handle_job_io(&mut self, token: JobToken, which: OutStream) {
        let Some(job) = self.registry.get_mut(token) else {
            // The job was destroyed earlier in this dispatch batch.
            return;
        };
        let (id, pid) = (job.id, job.pid);
        let outcome = gather_output(job, which, false, &mut self.mux);

        if let Some(errno) = outcome.error {
            self.wlog(format!("job {} (pid={}): Failed to read(): {}", id, pid, errno));
        }
        if outcome.closed {
            self.check_completion(token);
        }
    }

    /// Non-blocking probe: has this job's child exited? If so, finalize
    /// as a success and destroy. Returns true when the job is gone.
    fn check_completion(&mut self, token: JobToken) -> bool {
        let Some(pid) = self.registry.get(token).map(|j| j.pid) else {
            return false;
        };
        if pid == 0 {
            return false;
        }

        match wait::wait_nohang(pid) {
            Ok(WaitOutcome::Reaped { status, rusage, .. }) => {
                let Some(mut job) = self.registry.remove(token) else {
                    return false;
                };
                job.wait_status = status;
                job.rusage = rusage;
                self.finish_job(&mut job, None);
                self.destroy_job(job);
                true
            }
            Ok(WaitOutcome::NoChild) => {
                // Someone beat us to the wait; the status word stays zero.
                let Some(mut job) = self.registry.remove(token) else {
                    return false;
                };
                self.finish_job(&mut job, None);
                self.destroy_job(job);
                true
            }
            Ok(WaitOutcome::StillRunning) => false,
            Err(e) => {
                tracing::debug!(error = %e, pid, "wait probe failed");
                false
            }
        }
    }

    /// Kill a job that hit its deadline (or a stale-retry deadline).
    ///
    /// A job is considered reaped once our direct child is collected, or
    /// once kill/wait report it as already gone. A child the kernel will
    /// not release (uninterruptible sleep) goes stale: the master gets the
    /// timeout response immediately and reaping is retried on a backoff.
    fn kill_job(&mut self, token: JobToken, reason: KillReason) {
        let Some(job) = self.registry.get(token) else {
            return;
        };
        let (id, pid) = (job.id, job.pid);

        // The child may have exited cleanly just in time; prefer reaping
        // over killing.
        if reason == KillReason::TimedOut && self.check_completion(token) {
            self.timeouts += 1;
            self.wlog(format!(
                "job {} with pid {} reaped at timeout. timeouts={}; started={}",
                id, pid, self.timeouts, self.started
            ));
            return;
        }

        // Brutal but efficient: the negated pid reaches the whole group.
        // ESRCH just means the group is already gone; the wait below still
        // runs, because zombies outlive their group.
        match signal::kill(Pid::from_raw(-pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => self.wlog(format!("kill(-{}, SIGKILL) failed: {}", pid, e)),
        }

        match wait::wait_nohang(pid) {
            Ok(WaitOutcome::Reaped { .. }) | Ok(WaitOutcome::NoChild) => {}
            Ok(WaitOutcome::StillRunning) => {
                let Some(mut job) = self.registry.remove(token) else {
                    return;
                };
                // Signal sent but not acted on; reschedule a reap attempt
                // rather than hang around waiting.
                let delay = match reason {
                    KillReason::Stale => STALE_RETRY_SECS,
                    KillReason::TimedOut => {
                        job.state = JobState::Stale;
                        self.finish_job(&mut job, Some(KillReason::TimedOut));
                        FIRST_RETRY_SECS
                    }
                };
                let deadline = Utc::now() + chrono::Duration::seconds(delay);
                if let Some(handle) = job.handle.take() {
                    self.scheduler.remove(&handle);
                }
                job.handle = Some(self.scheduler.add(deadline, token));
                self.registry.insert(job);
                if reason == KillReason::Stale {
                    self.wlog(format!(
                        "Failed to reap child with pid {}. Next attempt @ {}",
                        pid,
                        fmt_utc(deadline)
                    ));
                }
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, pid, "wait after SIGKILL failed");
            }
        }

        let Some(mut job) = self.registry.remove(token) else {
            return;
        };
        if job.state != JobState::Stale {
            self.finish_job(&mut job, Some(reason));
        } else {
            self.wlog(format!("job {} (pid={}): Dormant child reaped", id, pid));
        }
        self.destroy_job(job);
    }

    /// Drain every reapable child, matching PIDs through the registry.
    fn reap_jobs(&mut self) {
        while REAPABLE.load(Ordering::Relaxed) > 0 {
            match wait::wait_any_nohang() {
                Ok(WaitOutcome::Reaped { pid, status, rusage }) => {
                    REAPABLE.fetch_sub(1, Ordering::Relaxed);
                    let Some(token) = self.registry.token_for_pid(pid) else {
                        // A grandchild we never owned; odd, but not ours.
                        tracing::debug!(pid, "reaped a child we did not start");
                        continue;
                    };
                    let Some(mut job) = self.registry.remove(token) else {
                        continue;
                    };
                    job.wait_status = status;
                    job.rusage = rusage;
                    if job.state != JobState::Stale {
                        self.finish_job(&mut job, None);
                    }
                    self.destroy_job(job);
                }
                Ok(WaitOutcome::StillRunning) | Ok(WaitOutcome::NoChild) => {
                    REAPABLE.store(0, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "reap wait failed");
                    REAPABLE.store(0, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    /// Compose and send the job's response. Called exactly once per job:
    /// at reap for completed jobs, at timeout for killed and stale ones.
    fn finish_job(&mut self, job: &mut Job, reason: Option<KillReason>) {
        // Final drain, then close whatever is still open.
        for which in [OutStream::Stdout, OutStream::Stderr] {
            if job.out_mut(which).fd.is_some() {
                gather_output(job, which, true, &mut self.mux);
                if let Some(fd) = job.out_mut(which).fd.take() {
                    self.mux.deregister(fd.as_raw_fd());
                }
            }
        }

        job.scrub_nul_bytes();
        job.stop = Utc::now();

        if self.running != self.scheduler.len() as u32 {
            let running = self.running;
            let scheduled = self.scheduler.len();
            let started = self.started;
            self.wlog(format!(
                "running jobs ({}) != scheduled timeouts ({})",
                running, scheduled
            ));
            self.wlog(format!(
                "started: {}; running: {}; finished: {}",
                started,
                running,
                started - running
            ));
        }

        let runtime =
            (job.stop - job.start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;

        // Request echo first, minus environment entries.
        let mut resp = KvVec::with_capacity(job.request.len() + 12);
        for pair in job.request.iter() {
            if pair.key == b"env" {
                continue;
            }
            resp.push(pair.key.clone(), pair.value.clone());
        }
        resp.push("wait_status", job.wait_status.to_string());
        resp.push("start", fmt_utc(job.start));
        resp.push("stop", fmt_utc(job.stop));
        resp.push("runtime", format!("{:.6}", runtime));
        match reason {
            None => {
                // The child ran to completion (possibly with a signal or a
                // nonzero code; the master reads wait_status).
                resp.push("exited_ok", "1");
                resp.push("ru_utime", fmt_timeval(job.rusage.ru_utime));
                resp.push("ru_stime", fmt_timeval(job.rusage.ru_stime));
                resp.push("ru_minflt", job.rusage.ru_minflt.to_string());
                resp.push("ru_majflt", job.rusage.ru_majflt.to_string());
                resp.push("ru_inblock", job.rusage.ru_inblock.to_string());
                resp.push("ru_oublock", job.rusage.ru_oublock.to_string());
            }
            Some(r) => {
                resp.push("exited_ok", "0");
                resp.push("error_code", r.error_code().to_string());
            }
        }
        resp.push("outerr", std::mem::take(&mut job.outerr.buf));
        resp.push("outstd", std::mem::take(&mut job.outstd.buf));

        self.send_to_master(&resp);
    }

    /// Release everything a job holds. Runs exactly once, strictly after
    /// finalization (except that stale jobs finalized long before).
    fn destroy_job(&mut self, mut job: Job) {
        if let Some(handle) = job.handle.take() {
            self.scheduler.remove(&handle);
        }
        self.running = self.running.saturating_sub(1);
        self.registry.unindex_pid(job.pid);
        for which in [OutStream::Stdout, OutStream::Stderr] {
            if let Some(fd) = job.out_mut(which).fd.take() {
                self.mux.deregister(fd.as_raw_fd());
            }
        }
        // Buffers, request vector and command drop with the job.
    }

    /// Report a request that never became a running job.
    fn job_error(&mut self, id: Option<u32>, request: KvVec, msg: String) {
        tracing::warn!(job_id = id, "{}", msg);
        let mut resp = request;
        if let Some(id) = id {
            resp.push("job_id", id.to_string());
        }
        resp.push("error_msg", msg);
        self.send_to_master(&resp);
    }

    /// Short diagnostic to the master, as a single-pair `log=` frame.
    fn wlog(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::debug!("{}", msg);
        let mut kv = KvVec::with_capacity(1);
        kv.push("log", msg);
        if let Err(Errno::EPIPE) = codec::send_kv(&self.master, &kv) {
            self.emergency_exit(1);
        }
    }

    fn send_to_master(&mut self, kv: &KvVec) {
        match codec::send_kv(&self.master, kv) {
            Ok(_) => {}
            Err(Errno::EPIPE) => {
                tracing::error!("master pipe broken while sending");
                self.emergency_exit(1);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send frame to master");
            }
        }
    }

    /// Last resort exit: kill everything we spawned, reap what we can,
    /// and leave. Also the orderly path when the master disconnects.
    fn emergency_exit(&mut self, code: i32) -> ! {
        tracing::info!(code, jobs = self.running, "shutting down");

        // Ignore the broadcast so we do not terminate ourselves.
        unsafe {
            let _ = signal::signal(Signal::SIGTERM, SigHandler::SigIgn);
        }
        let _ = signal::kill(Pid::from_raw(0), Signal::SIGTERM);
        drain_zombies();
        std::thread::sleep(Duration::from_secs(1));

        // Anything still scheduled gets its whole process group killed.
        while let Some(token) = self.scheduler.pop() {
            if let Some(job) = self.registry.get(token) {
                if job.pid > 0 {
                    let _ = signal::kill(Pid::from_raw(-job.pid), Signal::SIGKILL);
                }
            }
        }
        std::thread::sleep(Duration::from_secs(1));
        drain_zombies();

        std::process::exit(code);
    }
}

/// Drain one output descriptor per the gather contract: append available
/// bytes, retry EINTR, stop on EAGAIN, close on EOF or hard errors. The
/// final drain (at finalization) closes unconditionally afterwards.
fn gather_output(job: &mut Job, which: OutStream, final_read: bool, mux: &mut IoMux) -> GatherOutcome {
    let token = job.token;
    let out = job.out_mut(which);
    let mut error = None;

    loop {
        let Some(fd) = out.fd.as_ref() else {
            return GatherOutcome { closed: false, error };
        };
        let mut scratch = [0u8; 4096];
        match nix::unistd::read(fd.as_raw_fd(), &mut scratch) {
            Ok(0) => {
                close_out(out, mux);
                return GatherOutcome {
                    closed: !final_read,
                    error,
                };
            }
            Ok(n) => {
                // Keep reading: a single readiness event may cover more
                // data than one scratch buffer.
                out.buf.extend_from_slice(&scratch[..n]);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                return GatherOutcome {
                    closed: false,
                    error,
                };
            }
            Err(e) => {
                // EBADF, EIO and friends: nothing to be done but close.
                tracing::debug!(error = %e, token, "pipe read failed");
                error = Some(e);
                close_out(out, mux);
                return GatherOutcome {
                    closed: !final_read,
                    error,
                };
            }
        }
    }
}

fn close_out(out: &mut job::OutBuf, mux: &mut IoMux) {
    if let Some(fd) = out.fd.take() {
        mux.deregister(fd.as_raw_fd());
    }
}

fn drain_zombies() {
    loop {
        match wait::wait_any_nohang() {
            Ok(WaitOutcome::Reaped { .. }) => continue,
            _ => return,
        }
    }
}

/// `<seconds>.<microseconds>` with six-digit micros, the wire format for
/// every timestamp field.
fn fmt_utc(t: DateTime<Utc>) -> String {
    format!("{}.{:06}", t.timestamp(), t.timestamp_subsec_micros())
}

fn fmt_timeval(tv: libc::timeval) -> String {
    format!("{}.{:06}", tv.tv_sec, tv.tv_usec)
}

/// chdir to the invoking user's home directory, falling back to `/`.
fn chdir_home() {
    let home = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.dir);
    let moved = home
        .as_deref()
        .map(|dir| nix::unistd::chdir(dir).is_ok())
        .unwrap_or(false);
    if !moved {
        let _ = nix::unistd::chdir("/");
    }
}

/// SIGCHLD bumps the reapable counter; SIGPIPE is ignored so writes to a
/// dead master surface as EPIPE instead of killing the process.
fn install_signal_handlers() -> Result<()> {
    let chld = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic.
    unsafe {
        signal::sigaction(Signal::SIGCHLD, &chld)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

fn set_cloexec(fd: &impl AsFd) -> Result<()> {
    nix::fcntl::fcntl(
        fd.as_fd().as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )?;
    Ok(())
}

/// Close-on-exec, non-blocking, and generous kernel buffers for the
/// master socket.
fn set_sockopts(fd: &impl AsFd, bufsize: usize) -> Result<()> {
    set_cloexec(fd)?;
    let raw = fd.as_fd().as_raw_fd();
    let flags = nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFL)?;
    let flags = nix::fcntl::OFlag::from_bits_truncate(flags) | nix::fcntl::OFlag::O_NONBLOCK;
    nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_SETFL(flags))?;
    socket::setsockopt(fd, sockopt::SndBuf, &bufsize)?;
    socket::setsockopt(fd, sockopt::RcvBuf, &bufsize)?;
    Ok(())
}
