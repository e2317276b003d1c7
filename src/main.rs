use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use procwarden::auth::Principals;
use procwarden::cgroup::CgroupController;
use procwarden::config::{LimitSource, SupervisorConfig, TlsConfig};
use procwarden::grpc::GrpcServer;
use procwarden::limits::{DeviceId, LimitSpecs};
use procwarden::shutdown;
use procwarden::supervisor::Supervisor;
use procwarden::tls;

#[derive(Parser, Debug)]
#[command(name = "procwarden")]
#[command(about = "A job-worker daemon that runs processes under cgroup limits")]
struct Args {
    /// Address to listen on for gRPC
    #[arg(long, default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// CA certificate that client certificates must chain to
    #[arg(long)]
    ca_cert: PathBuf,

    /// Server certificate
    #[arg(long)]
    cert: PathBuf,

    /// Server private key
    #[arg(long)]
    key: PathBuf,

    /// JSON file mapping client certificate fingerprints to identities and roles
    #[arg(long)]
    principals: PathBuf,

    /// Directory with cpu_limit, memory_limit, disk_io_limit files,
    /// re-read on every Start
    #[arg(long)]
    limits_dir: Option<PathBuf>,

    /// Inline CPU limit, used when --limits-dir is not given (e.g. "50%")
    #[arg(long, default_value = "100%")]
    cpu: String,

    /// Inline memory limit (e.g. "512M")
    #[arg(long, default_value = "1G")]
    memory: String,

    /// Inline write-bandwidth limit (e.g. "8:0 10M/s")
    #[arg(long, default_value = "")]
    io: String,

    /// Directory the per-job cgroups are created under; its parent must be
    /// the cgroup filesystem mount
    #[arg(long, default_value = "/sys/fs/cgroup/procwarden")]
    cgroup_root: PathBuf,

    /// Default device (major:minor) for I/O limits that name none
    #[arg(long)]
    io_device: Option<String>,

    /// Run without cgroups; jobs get no resource limits (development only)
    #[arg(long)]
    no_cgroups: bool,

    /// Seconds a stopped job gets between SIGTERM and SIGKILL
    #[arg(long, default_value = "10")]
    grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let principals = Principals::load(&args.principals)?;
    if principals.is_empty() {
        tracing::warn!(
            path = %args.principals.display(),
            "principals file maps no certificates, every call will be rejected"
        );
    }

    let io_device: Option<DeviceId> = match &args.io_device {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| format!("invalid --io-device {raw:?}, expected major:minor"))?,
        ),
        None => None,
    };

    // An unusable cgroup root is fatal: the server cannot enforce limits.
    let cgroups = if args.no_cgroups {
        CgroupController::disabled()
    } else {
        let (mount, namespace) = split_cgroup_root(&args.cgroup_root)?;
        CgroupController::new(mount, namespace, io_device)?
    };

    let limits = match args.limits_dir {
        Some(dir) => LimitSource::Dir(dir),
        None => LimitSource::Inline(LimitSpecs {
            cpu: args.cpu,
            memory: args.memory,
            io: args.io,
        }),
    };
    let supervisor = Arc::new(Supervisor::new(
        SupervisorConfig {
            limits,
            grace: Duration::from_secs(args.grace_secs),
        },
        cgroups,
    ));

    let tls = tls::server_tls(&TlsConfig {
        ca_cert: args.ca_cert,
        cert: args.cert,
        key: args.key,
    })
    .await?;

    let token = shutdown::shutdown_token();
    let server = GrpcServer::new(args.listen, supervisor.clone(), principals, tls);
    server.run(token).await?;

    // The listener is closed; kill whatever is still running so no process
    // or cgroup outlives the daemon.
    supervisor.shutdown().await;

    Ok(())
}

/// `<mount>/<namespace>` as one path, the way it appears on disk.
fn split_cgroup_root(root: &Path) -> Result<(PathBuf, String), String> {
    let namespace = root
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned);
    match (root.parent(), namespace) {
        (Some(mount), Some(namespace)) if !mount.as_os_str().is_empty() => {
            Ok((mount.to_path_buf(), namespace))
        }
        _ => Err(format!(
            "invalid --cgroup-root {}: expected <mount>/<namespace>",
            root.display()
        )),
    }
}
