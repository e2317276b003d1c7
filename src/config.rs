use std::path::PathBuf;
use std::time::Duration;

use crate::limits::LimitSpecs;

/// Where Start reads the per-job resource limits from.
#[derive(Debug, Clone)]
pub enum LimitSource {
    /// `cpu_limit`, `memory_limit`, `disk_io_limit` files in a directory,
    /// re-read on every Start.
    Dir(PathBuf),
    /// Fixed in-band strings.
    Inline(LimitSpecs),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub limits: LimitSource,
    /// How long a stopped job gets between SIGTERM and SIGKILL.
    pub grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            limits: LimitSource::Inline(LimitSpecs {
                cpu: "100%".into(),
                memory: "1G".into(),
                io: String::new(),
            }),
            grace: Duration::from_secs(10),
        }
    }
}

/// Paths to the PEM material. All three are required; the server has no
/// plaintext mode.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}
