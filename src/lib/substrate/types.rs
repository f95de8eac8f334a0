use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::lib::error::ControllerError;
use crate::lib::ledger::types::Resources;

/// Opaque reference to a unit of work inside the execution substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkloadHandle {
    pub id: String,
    /// Address the workload is reachable at from this host, when known.
    pub address: Option<String>,
}

/// What the launcher asks the substrate to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub image: String,
    pub resources: Resources,
    pub service_name: String,
    /// Port the workload serves on inside its sandbox.
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    /// Transient: daemon unreachable, timeouts, resource churn.
    #[error("{0}")]
    Unavailable(String),

    /// Permanent: the request itself cannot be run.
    #[error("{0}")]
    InvalidSpec(String),

    /// The host port could not be bound.
    #[error("host port {0} is not available")]
    PortUnavailable(u16),
}

impl From<SubstrateError> for ControllerError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::Unavailable(msg) => ControllerError::SubstrateUnavailable(msg),
            SubstrateError::InvalidSpec(msg) => ControllerError::InvalidSpec(msg),
            SubstrateError::PortUnavailable(port) => ControllerError::PortInUse(port),
        }
    }
}

/// The system that actually runs workloads. Implementations perform no
/// resource accounting; the ledger has already admitted every request.
#[async_trait]
pub trait Substrate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocatable capacity, read once at startup.
    async fn capacity(&self) -> Result<Resources, SubstrateError>;

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkloadHandle, SubstrateError>;

    /// Tears a workload down. A workload that no longer exists counts as torn down.
    async fn terminate(&self, handle: &WorkloadHandle) -> Result<(), SubstrateError>;

    async fn resize(
        &self,
        handle: &WorkloadHandle,
        resources: Resources,
    ) -> Result<(), SubstrateError>;

    /// Makes the workload reachable on `node_port` of this host.
    async fn publish(&self, handle: &WorkloadHandle, node_port: u16) -> Result<(), SubstrateError>;

    async fn unpublish(&self, handle: &WorkloadHandle, node_port: u16)
    -> Result<(), SubstrateError>;
}
