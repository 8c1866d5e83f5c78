//! poll(2) adapter: readiness over the master socket and every job pipe.

use std::collections::BTreeMap;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use super::job::JobToken;

/// What a registered descriptor belongs to. Dispatch is a match on this
/// tag rather than stored callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdTag {
    Master,
    JobStdout(JobToken),
    JobStderr(JobToken),
}

/// Readiness that warrants a read attempt: data, hangup, or error. The
/// read itself sorts out which.
const READY: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR)
    .union(PollFlags::POLLNVAL);

#[derive(Debug, Default)]
pub struct IoMux {
    fds: BTreeMap<RawFd, FdTag>,
}

impl IoMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: RawFd, tag: FdTag) {
        self.fds.insert(fd, tag);
    }

    pub fn deregister(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
    }

    /// Number of registered descriptors; the event loop runs while > 0.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Block until readiness or timeout. `None` waits indefinitely.
    ///
    /// EINTR yields an empty ready set so the caller can process the
    /// SIGCHLD counter; callers treat an empty set like a timeout.
    pub fn poll(&self, timeout_ms: Option<i32>) -> nix::Result<Vec<(RawFd, FdTag)>> {
        let entries: Vec<(RawFd, FdTag)> =
            self.fds.iter().map(|(&fd, &tag)| (fd, tag)).collect();

        // SAFETY: every registered fd is owned by the worker or one of its
        // jobs and stays open for the duration of this call; handlers that
        // close fds run only after the ready set is returned.
        let mut pollfds: Vec<PollFd> = entries
            .iter()
            .map(|&(fd, _)| {
                PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)
            })
            .collect();

        let timeout = match timeout_ms {
            None => PollTimeout::NONE,
            Some(ms) => PollTimeout::try_from(ms.max(0)).unwrap_or(PollTimeout::MAX),
        };

        match poll(&mut pollfds, timeout) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => Ok(entries
                .iter()
                .zip(pollfds.iter())
                .filter(|(_, pfd)| {
                    pfd.revents().is_some_and(|ev| ev.intersects(READY))
                })
                .map(|(&entry, _)| entry)
                .collect()),
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_register_deregister() {
        let mut mux = IoMux::new();
        assert_eq!(mux.len(), 0);
        mux.register(10, FdTag::Master);
        mux.register(11, FdTag::JobStdout(1));
        assert_eq!(mux.len(), 2);
        mux.deregister(10);
        assert_eq!(mux.len(), 1);
        mux.deregister(10);
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_poll_reports_readable_fd() {
        let (r, w) = nix::unistd::pipe().expect("pipe");
        let mut mux = IoMux::new();
        mux.register(r.as_raw_fd(), FdTag::JobStdout(7));

        // Nothing written yet: zero timeout elapses with no events.
        let ready = mux.poll(Some(0)).expect("poll");
        assert!(ready.is_empty());

        nix::unistd::write(&w, b"x").expect("write");
        let ready = mux.poll(Some(1000)).expect("poll");
        assert_eq!(ready, vec![(r.as_raw_fd(), FdTag::JobStdout(7))]);
    }

    #[test]
    fn test_poll_reports_hangup() {
        let (r, w) = nix::unistd::pipe().expect("pipe");
        let mut mux = IoMux::new();
        mux.register(r.as_raw_fd(), FdTag::JobStderr(3));

        drop(w);
        let ready = mux.poll(Some(1000)).expect("poll");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1, FdTag::JobStderr(3));
    }
}
