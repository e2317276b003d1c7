use thiserror::Error;
use uuid::Uuid;

use crate::auth::{Operation, Role};
use crate::cgroup::CgroupError;
use crate::limits::LimitsError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid resource limits: {0}")]
    BadLimits(#[from] LimitsError),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("cgroup setup failed: {0}")]
    Resource(#[from] CgroupError),

    #[error("failed to spawn job: {0}")]
    Spawn(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {0} already exited")]
    AlreadyExited(Uuid),

    #[error("{op} is not permitted for role {role}")]
    PermissionDenied { role: Role, op: Operation },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for SupervisorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => SupervisorError::NotFound(id),
        }
    }
}

impl From<SupervisorError> for tonic::Status {
    fn from(e: SupervisorError) -> Self {
        let message = e.to_string();
        match e {
            SupervisorError::BadLimits(_) | SupervisorError::InvalidCommand(_) => {
                tonic::Status::invalid_argument(message)
            }
            SupervisorError::Resource(_) => tonic::Status::resource_exhausted(message),
            SupervisorError::NotFound(_) => tonic::Status::not_found(message),
            SupervisorError::AlreadyExited(_) => tonic::Status::failed_precondition(message),
            SupervisorError::PermissionDenied { .. } => tonic::Status::permission_denied(message),
            SupervisorError::Spawn(_) | SupervisorError::Internal(_) => {
                tonic::Status::internal(message)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
