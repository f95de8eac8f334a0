//! Error taxonomy shared by every controller component.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::lib::tasks::types::TaskState;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// Malformed or missing request fields, non-positive resource amounts.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The ledger cannot satisfy a reservation.
    #[error(
        "insufficient capacity: requested {requested_cpus} CPUs / {requested_gpus} GPUs, \
         free {free_cpus} CPUs / {free_gpus} GPUs"
    )]
    InsufficientCapacity {
        requested_cpus: u32,
        requested_gpus: u32,
        free_cpus: u32,
        free_gpus: u32,
    },

    #[error("task '{0}' already exists")]
    AlreadyExists(String),

    #[error("task '{0}' not found")]
    NotFound(String),

    /// The task's lifecycle state does not allow the requested operation.
    #[error("task '{name}' cannot move from {from} to {to}")]
    InvalidState {
        name: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("no free node port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("service '{service}' is not exposed on port {port}")]
    ServiceNotExposed { service: String, port: u16 },

    /// Transient infrastructure failure; the caller may retry the whole operation.
    #[error("execution substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    /// Permanent rejection by the execution substrate.
    #[error("workload spec rejected: {0}")]
    InvalidSpec(String),

    /// Ledger and registry disagree. Never corrected silently.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
}

impl ControllerError {
    /// Stable machine-readable kind surfaced to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::PortInUse(_) => "port_in_use",
            Self::PortsExhausted { .. } => "ports_exhausted",
            Self::ServiceNotExposed { .. } => "service_not_exposed",
            Self::SubstrateUnavailable(_) => "substrate_unavailable",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::ConsistencyViolation(_) => "consistency_violation",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_)
            | Self::InvalidState { .. }
            | Self::PortInUse(_)
            | Self::ServiceNotExposed { .. } => StatusCode::CONFLICT,
            Self::InsufficientCapacity { .. } | Self::InvalidSpec(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::PortsExhausted { .. } | Self::SubstrateUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ConsistencyViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient kinds the client may retry unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SubstrateUnavailable(_) | Self::PortsExhausted { .. }
        )
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            retryable: self.is_transient(),
        };
        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn every_kind() -> Vec<ControllerError> {
        vec![
            ControllerError::InvalidInput("cpus".into()),
            ControllerError::InsufficientCapacity {
                requested_cpus: 6,
                requested_gpus: 1,
                free_cpus: 4,
                free_gpus: 1,
            },
            ControllerError::AlreadyExists("t1".into()),
            ControllerError::NotFound("t1".into()),
            ControllerError::InvalidState {
                name: "t1".into(),
                from: TaskState::Terminating,
                to: TaskState::Running,
            },
            ControllerError::PortInUse(30080),
            ControllerError::PortsExhausted {
                start: 30000,
                end: 30001,
            },
            ControllerError::ServiceNotExposed {
                service: "t1-service".into(),
                port: 30080,
            },
            ControllerError::SubstrateUnavailable("timeout".into()),
            ControllerError::InvalidSpec("bad image".into()),
            ControllerError::ConsistencyViolation("double release".into()),
        ]
    }

    #[test]
    fn test_kinds_are_distinct() {
        let errors = every_kind();
        let kinds: HashSet<_> = errors.iter().map(ControllerError::kind).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ControllerError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ControllerError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ControllerError::ConsistencyViolation("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(ControllerError::SubstrateUnavailable("x".into()).is_transient());
        assert!(!ControllerError::InvalidSpec("x".into()).is_transient());
    }

    #[test]
    fn test_capacity_message() {
        let err = ControllerError::InsufficientCapacity {
            requested_cpus: 6,
            requested_gpus: 1,
            free_cpus: 4,
            free_gpus: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient capacity: requested 6 CPUs / 1 GPUs, free 4 CPUs / 1 GPUs"
        );
    }
}
