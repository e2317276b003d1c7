//! Tests for the gRPC service layer: authentication, role enforcement, and
//! the error-code mapping. The caller is injected through request
//! extensions, standing in for the certificate resolution the transport
//! performs in production.

use std::sync::Arc;
use std::time::Duration;

use procwarden::auth::{AuthContext, Principals, Role};
use procwarden::cgroup::CgroupController;
use procwarden::config::{LimitSource, SupervisorConfig};
use procwarden::grpc::WardenService;
use procwarden::limits::LimitSpecs;
use procwarden::proto::job_service_server::JobService;
use procwarden::proto::{
    ListRequest, QueryRequest, QueryResponse, StartRequest, StopRequest, StreamRequest,
};
use procwarden::supervisor::Supervisor;
use tonic::{Code, Request};
use uuid::Uuid;

fn writer() -> AuthContext {
    AuthContext {
        identity: "alice".to_string(),
        role: Role::Writer,
    }
}

fn reader() -> AuthContext {
    AuthContext {
        identity: "bob".to_string(),
        role: Role::Reader,
    }
}

fn test_service() -> WardenService {
    let supervisor = Supervisor::new(
        SupervisorConfig {
            limits: LimitSource::Inline(LimitSpecs {
                cpu: "100%".to_string(),
                memory: "64M".to_string(),
                io: String::new(),
            }),
            grace: Duration::from_secs(1),
        },
        CgroupController::disabled(),
    );
    WardenService::new(Arc::new(supervisor), Principals::default())
}

fn request_as<T>(message: T, caller: AuthContext) -> Request<T> {
    let mut request = Request::new(message);
    request.extensions_mut().insert(caller);
    request
}

async fn start_job(service: &WardenService, command: &str, args: &[&str]) -> String {
    let response = service
        .start(request_as(
            StartRequest {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            writer(),
        ))
        .await
        .unwrap();
    response.into_inner().job_id
}

async fn wait_exited(service: &WardenService, job_id: &str, caller: AuthContext) -> QueryResponse {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let response = service
            .query(request_as(
                QueryRequest {
                    job_id: job_id.to_string(),
                },
                caller.clone(),
            ))
            .await
            .unwrap()
            .into_inner();
        if response.exited {
            return response;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not exit in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn collect_stream(service: &WardenService, job_id: &str, caller: AuthContext) -> Vec<u8> {
    let response = service
        .stream(request_as(
            StreamRequest {
                job_id: job_id.to_string(),
            },
            caller,
        ))
        .await
        .unwrap();
    let mut rx = response.into_inner().into_inner();
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend(chunk.unwrap().output);
    }
    out
}

#[tokio::test]
async fn test_start_query_stream_roundtrip() {
    let service = test_service();

    let job_id = start_job(&service, "/bin/echo", &["hello"]).await;
    let status = wait_exited(&service, &job_id, writer()).await;

    assert_eq!(status.exit_code, 0);
    assert_eq!(status.state, "exited");
    assert!(status.start_time_ms > 0);
    assert!(status.end_time_ms >= status.start_time_ms);

    assert_eq!(collect_stream(&service, &job_id, writer()).await, b"hello\n");
}

#[tokio::test]
async fn test_unauthenticated_caller_rejected() {
    let service = test_service();

    // No injected caller and no TLS peer info on a bare request.
    let status = service
        .query(Request::new(QueryRequest {
            job_id: Uuid::new_v4().to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_reader_cannot_start_or_stop() {
    let service = test_service();

    let status = service
        .start(request_as(
            StartRequest {
                command: "/bin/echo".to_string(),
                args: vec!["hi".to_string()],
            },
            reader(),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let job_id = start_job(&service, "/bin/sleep", &["60"]).await;
    let status = service
        .stop(request_as(
            StopRequest {
                job_id: job_id.clone(),
            },
            reader(),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    // The same reader may observe the job.
    service
        .query(request_as(
            QueryRequest {
                job_id: job_id.clone(),
            },
            reader(),
        ))
        .await
        .unwrap();

    service
        .stop(request_as(StopRequest { job_id }, writer()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reader_can_stream() {
    let service = test_service();

    let job_id = start_job(&service, "/bin/echo", &["shared"]).await;
    wait_exited(&service, &job_id, reader()).await;

    assert_eq!(
        collect_stream(&service, &job_id, reader()).await,
        b"shared\n"
    );
}

#[tokio::test]
async fn test_stop_terminates_job() {
    let service = test_service();

    let job_id = start_job(&service, "/bin/sleep", &["60"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    service
        .stop(request_as(
            StopRequest {
                job_id: job_id.clone(),
            },
            writer(),
        ))
        .await
        .unwrap();

    let status = wait_exited(&service, &job_id, writer()).await;
    assert_eq!(status.exit_code, 128 + 15);
}

#[tokio::test]
async fn test_stop_after_exit_is_failed_precondition() {
    let service = test_service();

    let job_id = start_job(&service, "/bin/true", &[]).await;
    wait_exited(&service, &job_id, writer()).await;

    let status = service
        .stop(request_as(StopRequest { job_id }, writer()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_malformed_job_id_is_invalid_argument() {
    let service = test_service();

    let status = service
        .query(request_as(
            QueryRequest {
                job_id: "not-a-uuid".to_string(),
            },
            writer(),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let service = test_service();

    let status = service
        .query(request_as(
            QueryRequest {
                job_id: Uuid::new_v4().to_string(),
            },
            writer(),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn test_empty_command_is_invalid_argument() {
    let service = test_service();

    let status = service
        .start(request_as(
            StartRequest {
                command: String::new(),
                args: Vec::new(),
            },
            writer(),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_list_reports_jobs() {
    let service = test_service();

    let first = start_job(&service, "/bin/echo", &["a"]).await;
    let second = start_job(&service, "/bin/echo", &["b"]).await;
    wait_exited(&service, &first, writer()).await;
    wait_exited(&service, &second, writer()).await;

    let jobs = service
        .list(request_as(ListRequest {}, reader()))
        .await
        .unwrap()
        .into_inner()
        .jobs;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.state == "exited"));
    assert!(jobs.iter().any(|j| j.job_id == first));
    assert!(jobs.iter().any(|j| j.job_id == second));
}
