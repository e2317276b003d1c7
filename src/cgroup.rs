//! Per-job cgroup provisioning.
//!
//! The controller picks the unified (v2) or legacy (v1) hierarchy once at
//! startup and keeps that strategy for the process lifetime. Each job gets
//! its own directory (one under the namespace on v2, one per controller on
//! v1); the child attaches itself by writing to `cgroup.procs` before exec,
//! so limits are already enforced when the workload starts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;
use uuid::Uuid;

use crate::limits::{DeviceId, ResourceLimits};

const REMOVE_ATTEMPTS: u32 = 10;
const REMOVE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cgroup root {path} is not usable: {source}")]
    Root { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("I/O limit names no device and no default device is configured")]
    NoDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    V2,
    V1,
}

/// Creates and removes per-job cgroups under a namespace directory.
pub struct CgroupController {
    mount: PathBuf,
    namespace: String,
    hierarchy: Hierarchy,
    default_io_device: Option<DeviceId>,
    enforce: bool,
}

impl CgroupController {
    /// Detect the hierarchy and prepare the namespace directories. Fails if
    /// the cgroup filesystem is not writable; a server cannot enforce limits
    /// without it, so the caller treats this as fatal.
    pub fn new(
        mount: PathBuf,
        namespace: String,
        default_io_device: Option<DeviceId>,
    ) -> Result<Self, CgroupError> {
        let hierarchy = if mount.join("cgroup.controllers").exists() {
            Hierarchy::V2
        } else {
            Hierarchy::V1
        };

        let controller = Self {
            mount,
            namespace,
            hierarchy,
            default_io_device,
            enforce: true,
        };

        match hierarchy {
            Hierarchy::V2 => {
                let ns = controller.mount.join(&controller.namespace);
                fs::create_dir_all(&ns).map_err(|source| CgroupError::Root {
                    path: ns.clone(),
                    source,
                })?;
                // The namespace must delegate controllers to job leaves. The
                // top-level write can fail when the mount is managed by the
                // host (systemd usually enables these already); the namespace
                // write must succeed.
                let top = controller.mount.join("cgroup.subtree_control");
                if let Err(e) = fs::write(&top, "+cpu +memory +io") {
                    tracing::debug!(path = %top.display(), error = %e, "subtree_control not adjusted at mount root");
                }
                let ns_control = ns.join("cgroup.subtree_control");
                fs::write(&ns_control, "+cpu +memory +io").map_err(|source| CgroupError::Root {
                    path: ns_control,
                    source,
                })?;
            }
            Hierarchy::V1 => {
                for ctrl in ["cpu", "memory"] {
                    let dir = controller.mount.join(ctrl).join(&controller.namespace);
                    fs::create_dir_all(&dir).map_err(|source| CgroupError::Root {
                        path: dir.clone(),
                        source,
                    })?;
                }
            }
        }

        tracing::info!(
            mount = %controller.mount.display(),
            namespace = %controller.namespace,
            hierarchy = ?hierarchy,
            "cgroup controller ready"
        );
        Ok(controller)
    }

    /// A controller that provisions nothing. Jobs run unconfined; intended
    /// for unprivileged development and tests.
    pub fn disabled() -> Self {
        tracing::warn!("cgroup enforcement disabled, jobs will run without resource limits");
        Self {
            mount: PathBuf::new(),
            namespace: String::new(),
            hierarchy: Hierarchy::V2,
            default_io_device: None,
            enforce: false,
        }
    }

    pub fn hierarchy(&self) -> Hierarchy {
        self.hierarchy
    }

    /// Create the job's cgroup directories and write every limit file.
    /// Any failure rolls back whatever was created.
    pub fn create(&self, job_id: Uuid, limits: &ResourceLimits) -> Result<JobCgroup, CgroupError> {
        if !self.enforce {
            return Ok(JobCgroup::noop());
        }

        let mut cgroup = JobCgroup {
            dirs: Vec::new(),
            procs_paths: Vec::new(),
        };
        let result = match self.hierarchy {
            Hierarchy::V2 => self.create_v2(job_id, limits, &mut cgroup),
            Hierarchy::V1 => self.create_v1(job_id, limits, &mut cgroup),
        };
        if let Err(e) = result {
            cgroup.remove_now();
            return Err(e);
        }
        Ok(cgroup)
    }

    fn create_v2(
        &self,
        job_id: Uuid,
        limits: &ResourceLimits,
        cgroup: &mut JobCgroup,
    ) -> Result<(), CgroupError> {
        let dir = self.mount.join(&self.namespace).join(job_id.to_string());
        fs::create_dir(&dir).map_err(|source| CgroupError::Write {
            path: dir.clone(),
            source,
        })?;
        cgroup.dirs.push(dir.clone());
        cgroup.procs_paths.push(dir.join("cgroup.procs"));

        write_limit(
            &dir.join("cpu.max"),
            &format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
        )?;
        write_limit(&dir.join("memory.max"), &limits.memory_bytes.to_string())?;
        for entry in &limits.io_write_bps {
            let device = entry
                .device
                .or(self.default_io_device)
                .ok_or(CgroupError::NoDevice)?;
            write_limit(
                &dir.join("io.max"),
                &format!("{} wbps={}", device, entry.bytes_per_sec),
            )?;
        }
        Ok(())
    }

    fn create_v1(
        &self,
        job_id: Uuid,
        limits: &ResourceLimits,
        cgroup: &mut JobCgroup,
    ) -> Result<(), CgroupError> {
        let id = job_id.to_string();

        let cpu_dir = self.controller_dir("cpu", &id)?;
        write_limit(
            &cpu_dir.join("cpu.cfs_quota_us"),
            &limits.cpu_quota_us.to_string(),
        )?;
        write_limit(
            &cpu_dir.join("cpu.cfs_period_us"),
            &limits.cpu_period_us.to_string(),
        )?;
        cgroup.procs_paths.push(cpu_dir.join("cgroup.procs"));
        cgroup.dirs.push(cpu_dir);

        let mem_dir = self.controller_dir("memory", &id)?;
        write_limit(
            &mem_dir.join("memory.limit_in_bytes"),
            &limits.memory_bytes.to_string(),
        )?;
        cgroup.procs_paths.push(mem_dir.join("cgroup.procs"));
        cgroup.dirs.push(mem_dir);

        if !limits.io_write_bps.is_empty() {
            let blkio_dir = self.controller_dir("blkio", &id)?;
            for entry in &limits.io_write_bps {
                let device = entry
                    .device
                    .or(self.default_io_device)
                    .ok_or(CgroupError::NoDevice)?;
                write_limit(
                    &blkio_dir.join("blkio.throttle.write_bps_device"),
                    &format!("{} {}", device, entry.bytes_per_sec),
                )?;
            }
            cgroup.procs_paths.push(blkio_dir.join("cgroup.procs"));
            cgroup.dirs.push(blkio_dir);
        }
        Ok(())
    }

    fn controller_dir(&self, controller: &str, job_id: &str) -> Result<PathBuf, CgroupError> {
        let dir = self
            .mount
            .join(controller)
            .join(&self.namespace)
            .join(job_id);
        fs::create_dir_all(&dir).map_err(|source| CgroupError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }
}

fn write_limit(path: &Path, content: &str) -> Result<(), CgroupError> {
    fs::write(path, content).map_err(|source| CgroupError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Handle to one job's cgroup directories. A no-op handle (enforcement
/// disabled) has no paths.
#[derive(Debug, Clone)]
pub struct JobCgroup {
    dirs: Vec<PathBuf>,
    procs_paths: Vec<PathBuf>,
}

impl JobCgroup {
    fn noop() -> Self {
        Self {
            dirs: Vec::new(),
            procs_paths: Vec::new(),
        }
    }

    /// The `cgroup.procs` files the child writes itself into before exec.
    pub fn procs_paths(&self) -> &[PathBuf] {
        &self.procs_paths
    }

    pub fn exists(&self) -> bool {
        self.dirs.iter().any(|d| d.exists())
    }

    /// Remove the job's directories. Idempotent; already-removed directories
    /// are fine. The kernel reports EBUSY while members are still exiting,
    /// so removal retries a bounded number of times with backoff and logs
    /// if the directory ultimately cannot be removed.
    pub async fn remove(&self) {
        for dir in &self.dirs {
            let mut backoff = REMOVE_BACKOFF;
            for attempt in 1..=REMOVE_ATTEMPTS {
                match remove_cgroup_dir(dir) {
                    Ok(()) => break,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                    Err(e) if is_busy(&e) && attempt < REMOVE_ATTEMPTS => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_millis(500));
                    }
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove cgroup directory");
                        break;
                    }
                }
            }
        }
    }

    /// Synchronous best-effort removal, used to roll back a half-created
    /// cgroup inside `create`.
    fn remove_now(&self) {
        for dir in &self.dirs {
            if let Err(e) = remove_cgroup_dir(dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "rollback of cgroup directory failed");
                }
            }
        }
    }
}

/// `rmdir` the cgroup directory. Interface files cannot be unlinked on
/// cgroupfs and do not count against `rmdir` there; on an ordinary
/// filesystem (a controller pointed at a scratch mount) the entries have to
/// go first, so they are cleared best-effort.
fn remove_cgroup_dir(dir: &Path) -> io::Result<()> {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let _ = fs::remove_file(entry.path());
        }
    }
    fs::remove_dir(dir)
}

fn is_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::EBUSY as i32)
}
