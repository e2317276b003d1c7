use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::auth::{AuthContext, Principals};
use crate::proto::job_service_server::JobService;
use crate::proto::{
    JobSummary, ListRequest, ListResponse, QueryRequest, QueryResponse, StartRequest,
    StartResponse, StopRequest, StopResponse, StreamChunk, StreamRequest,
};
use crate::supervisor::Supervisor;

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// gRPC facade over the supervisor.
pub struct WardenService {
    supervisor: Arc<Supervisor>,
    principals: Principals,
}

impl WardenService {
    pub fn new(supervisor: Arc<Supervisor>, principals: Principals) -> Self {
        Self {
            supervisor,
            principals,
        }
    }

    /// Resolve the verified client certificate to a principal. Tests inject
    /// an [`AuthContext`] through the request extensions instead.
    fn authenticate<T>(&self, request: &Request<T>) -> Result<AuthContext, Status> {
        if let Some(ctx) = request.extensions().get::<AuthContext>() {
            return Ok(ctx.clone());
        }
        let certs = request
            .peer_certs()
            .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
        let cert = certs
            .first()
            .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
        self.principals
            .resolve(cert.as_ref())
            .ok_or_else(|| Status::permission_denied("unknown client certificate"))
    }
}

#[tonic::async_trait]
impl JobService for WardenService {
    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let caller = self.authenticate(&request)?;
        let req = request.into_inner();

        let job_id = self.supervisor.start(&caller, req.command, req.args).await?;
        Ok(Response::new(StartResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let caller = self.authenticate(&request)?;
        let job_id = parse_job_id(&request.get_ref().job_id)?;

        self.supervisor.stop(&caller, job_id).await?;
        Ok(Response::new(StopResponse {}))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryResponse>, Status> {
        let caller = self.authenticate(&request)?;
        let job_id = parse_job_id(&request.get_ref().job_id)?;

        let snapshot = self.supervisor.query(&caller, job_id)?;
        Ok(Response::new(QueryResponse {
            pid: snapshot.pid.map(|p| p as i32).unwrap_or(0),
            exit_code: snapshot.exit_code.unwrap_or(0),
            exited: snapshot.exited(),
            state: snapshot.state.to_string(),
            start_time_ms: snapshot.started_at.timestamp_millis(),
            end_time_ms: snapshot
                .ended_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
            detail: snapshot.detail.unwrap_or_default(),
        }))
    }

    type StreamStream = ReceiverStream<Result<StreamChunk, Status>>;

    async fn stream(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let caller = self.authenticate(&request)?;
        let job_id = parse_job_id(&request.get_ref().job_id)?;

        let mut reader = self.supervisor.stream(&caller, job_id)?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                // next_chunk is cancel-safe, so a client that goes away
                // releases the reader promptly even while the log is quiet
                let chunk = tokio::select! {
                    chunk = reader.next_chunk() => chunk,
                    _ = tx.closed() => break,
                };
                let Some(chunk) = chunk else { break };
                let message = StreamChunk {
                    output: chunk.to_vec(),
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn list(&self, request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let caller = self.authenticate(&request)?;

        let jobs = self
            .supervisor
            .list(&caller)?
            .into_iter()
            .map(|job| JobSummary {
                job_id: job.id.to_string(),
                state: job.state().to_string(),
                command: job.command.clone(),
            })
            .collect();
        Ok(Response::new(ListResponse { jobs }))
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("invalid job ID"))
}
