//! Non-blocking wait wrappers carrying resource usage.
//!
//! nix has no rusage-returning wait, so this drops to `libc::wait4`
//! directly. EINTR is retried in place: a SIGCHLD from the very child we
//! are waiting for must not abort the wait.

use nix::errno::Errno;

/// Result of a WNOHANG wait.
pub enum WaitOutcome {
    /// A child changed state and was collected.
    Reaped {
        pid: i32,
        status: i32,
        rusage: libc::rusage,
    },
    /// Children exist but none is ready to be collected.
    StillRunning,
    /// No children at all (ECHILD) -- whoever we were waiting for is
    /// already gone.
    NoChild,
}

/// `wait4(pid, WNOHANG)` with rusage. `pid == -1` waits for any child.
pub fn wait_nohang(pid: i32) -> nix::Result<WaitOutcome> {
    loop {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let res = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut rusage) };
        if res < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => return Ok(WaitOutcome::NoChild),
                e => return Err(e),
            }
        }
        if res == 0 {
            return Ok(WaitOutcome::StillRunning);
        }
        return Ok(WaitOutcome::Reaped {
            pid: res,
            status,
            rusage,
        });
    }
}

/// `wait3(WNOHANG)`: collect any child that has changed state.
pub fn wait_any_nohang() -> nix::Result<WaitOutcome> {
    wait_nohang(-1)
}
