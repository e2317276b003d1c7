//! Job records and the concurrent registry that owns them.
//!
//! The map lock is held only for lookup, insert, and listing; everything
//! mutable about a job sits behind the record's own mutex. Operations on
//! distinct jobs never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::logstore::LogHandle;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopping,
    Exited,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Stopping => write!(f, "stopping"),
            JobState::Exited => write!(f, "exited"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of a job, taken under the record lock.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub pid: Option<u32>,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

impl StatusSnapshot {
    pub fn exited(&self) -> bool {
        self.state == JobState::Exited
    }
}

/// Outcome of asking a job to stop, decided under the record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// Transitioned `Running -> Stopping`; the caller delivers SIGTERM to
    /// this process group.
    Signal { pid: u32 },
    /// A previous stop is in flight; nothing to do.
    AlreadyStopping,
    /// The job already exited (or never started).
    AlreadyDone,
}

#[derive(Debug)]
struct Lifecycle {
    state: JobState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    ended_at: Option<DateTime<Utc>>,
    note: Option<String>,
}

/// One job. Identity, command line, and the log handle are immutable; the
/// lifecycle fields are guarded by the record mutex.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub log: LogHandle,
    lifecycle: Mutex<Lifecycle>,
}

impl Job {
    pub fn running(
        id: Uuid,
        command: String,
        args: Vec<String>,
        owner: String,
        pid: u32,
        log: LogHandle,
    ) -> Self {
        Self {
            id,
            command,
            args,
            owner,
            started_at: Utc::now(),
            log,
            lifecycle: Mutex::new(Lifecycle {
                state: JobState::Running,
                pid: Some(pid),
                exit_code: None,
                ended_at: None,
                note: None,
            }),
        }
    }

    /// A job that never produced a process. Kept for audit; its log is
    /// already closed and empty.
    pub fn failed(
        id: Uuid,
        command: String,
        args: Vec<String>,
        owner: String,
        note: String,
        log: LogHandle,
    ) -> Self {
        Self {
            id,
            command,
            args,
            owner,
            started_at: Utc::now(),
            log,
            lifecycle: Mutex::new(Lifecycle {
                state: JobState::Failed,
                pid: None,
                exit_code: None,
                ended_at: Some(Utc::now()),
                note: Some(note),
            }),
        }
    }

    pub fn state(&self) -> JobState {
        self.lifecycle.lock().unwrap().state
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let lc = self.lifecycle.lock().unwrap();
        StatusSnapshot {
            pid: lc.pid,
            state: lc.state,
            exit_code: lc.exit_code,
            started_at: self.started_at,
            ended_at: lc.ended_at,
            detail: lc.note.clone(),
        }
    }

    /// `Running -> Stopping` if the job is still running; the signal itself
    /// is delivered by the caller, outside the lock.
    pub fn begin_stop(&self) -> StopDisposition {
        let mut lc = self.lifecycle.lock().unwrap();
        match lc.state {
            JobState::Running => {
                lc.state = JobState::Stopping;
                // a Running record always has a pid
                StopDisposition::Signal {
                    pid: lc.pid.expect("running job without pid"),
                }
            }
            JobState::Stopping => StopDisposition::AlreadyStopping,
            JobState::Exited | JobState::Failed => StopDisposition::AlreadyDone,
        }
    }

    /// Reaper-only: record the observed exit. The log writer must be closed
    /// by the caller while still holding no other lock, before the cgroup is
    /// removed.
    pub fn finalize(&self, exit_code: i32, note: Option<String>) {
        let mut lc = self.lifecycle.lock().unwrap();
        debug_assert!(matches!(lc.state, JobState::Running | JobState::Stopping));
        lc.state = JobState::Exited;
        lc.exit_code = Some(exit_code);
        lc.ended_at = Some(Utc::now());
        if note.is_some() {
            lc.note = note;
        }
    }
}

/// Concurrent map from job id to record.
#[derive(Default)]
pub struct Registry {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created record. A duplicate id means a UUID
    /// collision or a logic error; both are unrecoverable, so this panics.
    pub fn insert(&self, job: Arc<Job>) {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.insert(job.id, job.clone()).is_some() {
            panic!("duplicate job id {}", job.id);
        }
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<Job>, RegistryError> {
        self.jobs
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.jobs.read().unwrap().values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().unwrap().is_empty()
    }
}
