//! The spawn adapter: fork/exec a job's command with piped output.
//!
//! Children are placed in their own process group before exec so the
//! whole group (plugin plus any grandchildren) can be killed at once.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::Pid;

use super::job::Job;
use super::mux::{FdTag, IoMux};
use crate::error::{Result, WorkerError};

/// Bytes that hand the command line to the shell instead of a direct exec.
const SHELL_META: &[u8] = b"|&;<>()$`\"'\\*?~{}[]#\n";

/// Start a job's child process.
///
/// On success the job has its pid and both pipe read ends, set
/// non-blocking and registered with the mux. On failure the job is
/// untouched apart from having no pid, and the caller reports the error.
pub fn start_cmd(job: &mut Job, mux: &mut IoMux) -> Result<()> {
    let mut cmd = build_command(&job.command)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: setpgid is async-signal-safe; nothing else runs between
    // fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| WorkerError::Spawn(format!("{}: {}", job.command, e)))?;

    let stdout: OwnedFd = child
        .stdout
        .take()
        .ok_or_else(|| WorkerError::Spawn("child stdout not captured".into()))?
        .into();
    let stderr: OwnedFd = child
        .stderr
        .take()
        .ok_or_else(|| WorkerError::Spawn("child stderr not captured".into()))?
        .into();

    // Plugins may exit without draining; the worker must never block on a
    // pipe read.
    set_nonblocking(&stdout)?;
    set_nonblocking(&stderr)?;

    job.pid = child.id() as i32;
    mux.register(stdout.as_raw_fd(), FdTag::JobStdout(job.token));
    mux.register(stderr.as_raw_fd(), FdTag::JobStderr(job.token));
    job.outstd.fd = Some(stdout);
    job.outerr.fd = Some(stderr);

    // Reaping goes through wait4 on the event loop, not through the Child
    // handle, which is dropped here without waiting.
    Ok(())
}

/// Build the Command for a textual command line.
///
/// Lines with shell metacharacters run under `/bin/sh -c`; plain ones are
/// split on whitespace and exec'd directly.
fn build_command(cmdline: &str) -> Result<Command> {
    let trimmed = cmdline.trim();
    if trimmed.is_empty() {
        return Err(WorkerError::Spawn("empty command line".into()));
    }

    if needs_shell(trimmed) {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(trimmed);
        return Ok(cmd);
    }

    let mut parts = trimmed.split_whitespace();
    let mut cmd = match parts.next() {
        Some(prog) => Command::new(prog),
        None => return Err(WorkerError::Spawn("empty command line".into())),
    };
    cmd.args(parts);
    Ok(cmd)
}

fn needs_shell(cmdline: &str) -> bool {
    cmdline.bytes().any(|b| SHELL_META.contains(&b))
}

fn set_nonblocking(fd: &impl AsFd) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KvVec;
    use crate::worker::wait::{self, WaitOutcome};
    use std::time::{Duration, Instant};

    fn job_for(command: &str) -> Job {
        let mut kv = KvVec::new();
        kv.push("command", command);
        kv.push("job_id", "1");
        Job::from_request(1, kv)
    }

    fn reap(pid: i32) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match wait::wait_nohang(pid).expect("wait4") {
                WaitOutcome::Reaped { status, .. } => return status,
                WaitOutcome::StillRunning => {
                    assert!(Instant::now() < deadline);
                    std::thread::sleep(Duration::from_millis(10));
                }
                WaitOutcome::NoChild => panic!("child vanished"),
            }
        }
    }

    #[test]
    fn test_needs_shell() {
        assert!(needs_shell("echo hi | grep h"));
        assert!(needs_shell("sh -c 'exit 1'"));
        assert!(needs_shell("echo $HOME"));
        assert!(!needs_shell("/bin/echo plain args"));
    }

    #[test]
    fn test_start_cmd_pipes_and_pgroup() {
        let mut mux = IoMux::new();
        let mut job = job_for("/bin/echo hi");
        start_cmd(&mut job, &mut mux).expect("start");

        assert!(job.pid > 0);
        assert!(job.outstd.fd.is_some());
        assert!(job.outerr.fd.is_some());
        assert_eq!(mux.len(), 2);

        // The child leads its own process group. setpgid runs between fork
        // and exec in the child, so poll until it has taken effect.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match nix::unistd::getpgid(Some(Pid::from_raw(job.pid))) {
                Ok(pgid) if pgid == Pid::from_raw(job.pid) => break,
                _ => {
                    assert!(Instant::now() < deadline, "child never became group leader");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }

        let status = reap(job.pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    #[test]
    fn test_start_cmd_spawn_failure() {
        let mut mux = IoMux::new();
        let mut job = job_for("/definitely/not/a/binary");
        let err = start_cmd(&mut job, &mut mux).expect_err("must fail");
        assert!(matches!(err, WorkerError::Spawn(_)));
        assert_eq!(job.pid, 0);
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(build_command("").is_err());
        assert!(build_command("   ").is_err());
    }
}
