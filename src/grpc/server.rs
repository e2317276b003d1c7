use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, ServerTlsConfig};

use crate::auth::Principals;
use crate::grpc::service::WardenService;
use crate::proto::job_service_server::JobServiceServer;
use crate::supervisor::Supervisor;

pub struct GrpcServer {
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    principals: Principals,
    tls: ServerTlsConfig,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        principals: Principals,
        tls: ServerTlsConfig,
    ) -> Self {
        Self {
            addr,
            supervisor,
            principals,
            tls,
        }
    }

    /// Serve until the shutdown token fires. Clients must present a
    /// certificate chaining to the configured CA.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = WardenService::new(self.supervisor, self.principals);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .tls_config(self.tls)?
            .add_service(JobServiceServer::new(service))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
