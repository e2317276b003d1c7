//! The job supervisor: start, stop, query, and stream, plus the per-job
//! output pumps and reaper tasks.
//!
//! Each started job owns three concurrent tasks: two pumps draining the
//! stdout/stderr pipes into the log, and one reaper that waits for the child,
//! finalizes the record, and removes the cgroup. The reaper is the only task
//! that closes the log writer or touches the cgroup after spawn.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{AuthContext, Operation};
use crate::cgroup::{CgroupController, JobCgroup};
use crate::config::{LimitSource, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use crate::limits::ResourceLimits;
use crate::logstore::{log_buffer, LogReader, LogWriter};
use crate::registry::{Job, JobState, Registry, StatusSnapshot, StopDisposition};

const PUMP_BUF_SIZE: usize = 8192;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

pub struct Supervisor {
    registry: Arc<Registry>,
    cgroups: Arc<CgroupController>,
    config: SupervisorConfig,
    cores: u32,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, cgroups: CgroupController) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            registry: Arc::new(Registry::new()),
            cgroups: Arc::new(cgroups),
            config,
            cores,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Launch a job for `caller`. On success the record is visible in the
    /// registry before this returns.
    pub async fn start(
        &self,
        caller: &AuthContext,
        command: String,
        args: Vec<String>,
    ) -> Result<Uuid> {
        authorize(caller, Operation::Start)?;
        if command.trim().is_empty() {
            return Err(SupervisorError::InvalidCommand(
                "command must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let limits = self.load_limits()?;
        let cgroup = self.cgroups.create(id, &limits)?;

        match self.spawn_child(&command, &args, &cgroup) {
            Ok(mut child) => {
                let Some(pid) = child.id() else {
                    // wait() has not run, so this cannot happen; clean up anyway
                    let _ = child.start_kill();
                    cgroup.remove().await;
                    return Err(SupervisorError::Internal(
                        "spawned child has no pid".to_string(),
                    ));
                };
                Ok(self.adopt_child(id, command, args, caller, child, pid, cgroup))
            }
            Err(e) => {
                cgroup.remove().await;
                let (writer, log) = log_buffer();
                writer.close();
                let note = format!("spawn failed: {e}");
                tracing::warn!(job_id = %id, command = %command, error = %e, "failed to start job");
                self.registry.insert(Arc::new(Job::failed(
                    id,
                    command,
                    args,
                    caller.identity.clone(),
                    note.clone(),
                    log,
                )));
                Err(SupervisorError::Spawn(note))
            }
        }
    }

    fn spawn_child(
        &self,
        command: &str,
        args: &[String],
        cgroup: &JobCgroup,
    ) -> std::io::Result<Child> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let procs_paths = cgroup.procs_paths().to_vec();
        // Child-side setup, between fork and exec: detach into a fresh
        // session (its own process group, target of SIGTERM/SIGKILL later),
        // then attach to the cgroup by writing "0" (self) into cgroup.procs.
        // The workload therefore never runs outside its limits, and any
        // failure here surfaces as a spawn error in the parent.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                for procs in &procs_paths {
                    std::fs::write(procs, b"0")?;
                }
                Ok(())
            });
        }
        cmd.spawn()
    }

    #[allow(clippy::too_many_arguments)]
    fn adopt_child(
        &self,
        id: Uuid,
        command: String,
        args: Vec<String>,
        caller: &AuthContext,
        mut child: Child,
        pid: u32,
        cgroup: JobCgroup,
    ) -> Uuid {
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (writer, log) = log_buffer();
        let job = Arc::new(Job::running(
            id,
            command,
            args,
            caller.identity.clone(),
            pid,
            log,
        ));
        self.registry.insert(job.clone());

        let pump_out = spawn_pump(stdout, writer.clone());
        let pump_err = spawn_pump(stderr, writer.clone());
        tokio::spawn(reap(job, child, cgroup, writer, pump_out, pump_err));

        tracing::info!(job_id = %id, pid, owner = %caller.identity, "job started");
        id
    }

    /// Deliver SIGTERM to the job's process group and arm the grace timer.
    /// Returns without waiting for the exit; the reaper finalizes.
    pub async fn stop(&self, caller: &AuthContext, id: Uuid) -> Result<()> {
        authorize(caller, Operation::Stop)?;
        let job = self.registry.get(id)?;
        match job.begin_stop() {
            StopDisposition::AlreadyDone => Err(SupervisorError::AlreadyExited(id)),
            StopDisposition::AlreadyStopping => Ok(()),
            StopDisposition::Signal { pid } => {
                tracing::info!(job_id = %id, pid, "stopping job");
                signal_group(pid, Signal::SIGTERM);

                let grace = self.config.grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if job.state() == JobState::Stopping {
                        tracing::warn!(job_id = %job.id, pid, "grace period expired, sending SIGKILL");
                        signal_group(pid, Signal::SIGKILL);
                    }
                });
                Ok(())
            }
        }
    }

    pub fn query(&self, caller: &AuthContext, id: Uuid) -> Result<StatusSnapshot> {
        authorize(caller, Operation::Query)?;
        Ok(self.registry.get(id)?.snapshot())
    }

    /// A log reader positioned at offset zero. Valid at any point in the job
    /// lifecycle; after exit it replays the full output and terminates.
    pub fn stream(&self, caller: &AuthContext, id: Uuid) -> Result<LogReader> {
        authorize(caller, Operation::Stream)?;
        Ok(self.registry.get(id)?.log.reader())
    }

    pub fn list(&self, caller: &AuthContext) -> Result<Vec<Arc<Job>>> {
        authorize(caller, Operation::List)?;
        Ok(self.registry.list())
    }

    /// Kill every live job and wait for the reapers to finalize. Used on
    /// server shutdown so no process or cgroup outlives the supervisor.
    pub async fn shutdown(&self) {
        let mut live = Vec::new();
        for job in self.registry.list() {
            let snap = job.snapshot();
            if matches!(snap.state, JobState::Running | JobState::Stopping) {
                if let Some(pid) = snap.pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                live.push(job);
            }
        }
        if live.is_empty() {
            return;
        }
        tracing::info!(jobs = live.len(), "waiting for jobs to finalize");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
        for job in live {
            while job.state() != JobState::Exited {
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(job_id = %job.id, "job did not finalize before shutdown");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    fn load_limits(&self) -> Result<ResourceLimits> {
        let limits = match &self.config.limits {
            LimitSource::Dir(dir) => ResourceLimits::load(dir, self.cores)?,
            LimitSource::Inline(specs) => ResourceLimits::parse(specs, self.cores)?,
        };
        Ok(limits)
    }
}

fn authorize(caller: &AuthContext, op: Operation) -> Result<()> {
    if caller.role.allows(op) {
        Ok(())
    } else {
        Err(SupervisorError::PermissionDenied {
            role: caller.role,
            op,
        })
    }
}

fn signal_group(pid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {}
        // the group is gone: the job exited between the state check and here
        Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid, signal = %signal, error = %e, "failed to signal process group");
        }
    }
}

fn spawn_pump<R>(mut src: R, writer: LogWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; PUMP_BUF_SIZE];
        loop {
            match src.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => writer.append(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    tracing::debug!(error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    })
}

/// Wait for the child, drain the pumps, then finalize in order: close the
/// log writer, mark the record exited, remove the cgroup. Query can only
/// observe `exited` after the log is closed, so a Stream opened afterwards
/// terminates in finite time.
async fn reap(
    job: Arc<Job>,
    mut child: Child,
    cgroup: JobCgroup,
    writer: LogWriter,
    pump_out: JoinHandle<()>,
    pump_err: JoinHandle<()>,
) {
    let status = child.wait().await;

    // Pipe EOF: the pumps stop once every write end is closed.
    let _ = pump_out.await;
    let _ = pump_err.await;

    let (exit_code, note) = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => (-1, Some(format!("wait failed: {e}"))),
    };

    writer.close();
    job.finalize(exit_code, note);
    cgroup.remove().await;
    tracing::info!(job_id = %job.id, exit_code, "job exited");
}

fn exit_code_of(status: std::process::ExitStatus) -> (i32, Option<String>) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        (code, None)
    } else if let Some(signal) = status.signal() {
        // shell convention, so Query reports a single integer
        (128 + signal, None)
    } else {
        (-1, Some(format!("unrecognized wait status: {status:?}")))
    }
}
