//! The job registry: sole owner of in-flight jobs, plus the PID fanout.

use std::collections::HashMap;

use super::job::{Job, JobToken};

/// Expected upper bound on concurrently running children.
const FANOUT_CAPACITY: usize = 4096;

/// Owns every in-flight job, indexed by token, with a PID fanout for the
/// reaper. All mutation happens on the event-loop thread.
pub struct JobRegistry {
    jobs: HashMap<JobToken, Job>,
    by_pid: HashMap<i32, JobToken>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            by_pid: HashMap::with_capacity(FANOUT_CAPACITY),
        }
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.token, job);
    }

    pub fn get(&self, token: JobToken) -> Option<&Job> {
        self.jobs.get(&token)
    }

    pub fn get_mut(&mut self, token: JobToken) -> Option<&mut Job> {
        self.jobs.get_mut(&token)
    }

    /// Take a job out of the registry. Finalization paths take the job,
    /// work on it with the rest of the worker borrowed freely, and either
    /// destroy it or (stale case) put it back.
    pub fn remove(&mut self, token: JobToken) -> Option<Job> {
        self.jobs.remove(&token)
    }

    pub fn index_pid(&mut self, pid: i32, token: JobToken) {
        self.by_pid.insert(pid, token);
    }

    pub fn token_for_pid(&self, pid: i32) -> Option<JobToken> {
        self.by_pid.get(&pid).copied()
    }

    pub fn unindex_pid(&mut self, pid: i32) {
        self.by_pid.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KvVec;

    fn job(token: JobToken) -> Job {
        let mut kv = KvVec::new();
        kv.push("command", "/bin/true");
        kv.push("job_id", token.to_string());
        Job::from_request(token, kv)
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut reg = JobRegistry::new();
        reg.insert(job(1));
        reg.insert(job(2));
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.get(1).map(|j| j.token), Some(1));
        let taken = reg.remove(1).unwrap();
        assert_eq!(taken.token, 1);
        assert!(reg.get(1).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_pid_fanout() {
        let mut reg = JobRegistry::new();
        let mut j = job(5);
        j.pid = 1234;
        reg.insert(j);
        reg.index_pid(1234, 5);

        assert_eq!(reg.token_for_pid(1234), Some(5));
        assert_eq!(reg.token_for_pid(999), None);

        reg.unindex_pid(1234);
        assert_eq!(reg.token_for_pid(1234), None);
        // The job itself is still owned until removed.
        assert!(reg.get(5).is_some());
    }

    #[test]
    fn test_take_and_put_back() {
        let mut reg = JobRegistry::new();
        reg.insert(job(9));
        let mut taken = reg.remove(9).unwrap();
        taken.state = super::super::job::JobState::Stale;
        reg.insert(taken);
        assert_eq!(
            reg.get(9).map(|j| j.state),
            Some(super::super::job::JobState::Stale)
        );
    }
}
