use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::lib::error::ControllerResult;
use crate::lib::ledger::types::Resources;
use crate::lib::substrate::types::{LaunchRequest, Substrate, WorkloadHandle};
use crate::lib::substrate::with_deadline;
use crate::lib::tasks::types::TaskSpec;

/// Turns admitted tasks into substrate workloads. Performs no accounting:
/// callers reserve in the ledger first and compensate on failure.
pub struct Launcher {
    substrate: Arc<dyn Substrate>,
    deadline: Duration,
    container_port: u16,
}

impl Launcher {
    pub fn new(substrate: Arc<dyn Substrate>, deadline: Duration, container_port: u16) -> Self {
        Launcher {
            substrate,
            deadline,
            container_port,
        }
    }

    pub async fn launch(&self, spec: &TaskSpec, service_name: &str) -> ControllerResult<WorkloadHandle> {
        let request = LaunchRequest {
            name: spec.name.clone(),
            image: spec.image.clone(),
            resources: spec.resources,
            service_name: service_name.to_string(),
            container_port: self.container_port,
        };
        info!(
            task = %spec.name,
            image = %spec.image,
            cpus = spec.resources.cpus,
            gpus = spec.resources.gpus,
            substrate = self.substrate.name(),
            "launching"
        );

        let result = with_deadline(self.deadline, "launch", self.substrate.launch(&request)).await;
        match &result {
            Ok(handle) => info!(task = %spec.name, handle = %handle.id, "launched"),
            Err(e) => warn!(task = %spec.name, error = %e, kind = e.kind(), "launch failed"),
        }
        result
    }

    pub async fn terminate(&self, task: &str, handle: &WorkloadHandle) -> ControllerResult<()> {
        info!(task, handle = %handle.id, "terminating");
        let result = with_deadline(self.deadline, "terminate", self.substrate.terminate(handle)).await;
        if let Err(e) = &result {
            warn!(task, handle = %handle.id, error = %e, "terminate failed");
        }
        result
    }

    pub async fn resize(
        &self,
        task: &str,
        handle: &WorkloadHandle,
        resources: Resources,
    ) -> ControllerResult<()> {
        info!(task, handle = %handle.id, %resources, "resizing");
        with_deadline(self.deadline, "resize", self.substrate.resize(handle, resources)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::error::ControllerError;
    use crate::lib::substrate::memory::{MemorySubstrate, Operation};
    use crate::lib::substrate::types::SubstrateError;

    fn setup(deadline: Duration) -> (Arc<MemorySubstrate>, Launcher) {
        let substrate = Arc::new(MemorySubstrate::new(Resources::new(8, 2)));
        let launcher = Launcher::new(substrate.clone(), deadline, 8888);
        (substrate, launcher)
    }

    fn spec() -> TaskSpec {
        TaskSpec::new("t1", "jupyter/base-notebook", 2, 1).unwrap()
    }

    #[tokio::test]
    async fn test_launch_passes_container_port() {
        let (substrate, launcher) = setup(Duration::from_secs(5));
        launcher.launch(&spec(), "t1-service").await.unwrap();

        let workloads = substrate.workloads();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].request.container_port, 8888);
        assert_eq!(workloads[0].request.service_name, "t1-service");
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let (substrate, launcher) = setup(Duration::from_secs(5));
        substrate.fail_next(Operation::Launch, SubstrateError::InvalidSpec("unknown image".into()));
        substrate.fail_next(Operation::Launch, SubstrateError::Unavailable("daemon down".into()));

        assert!(matches!(
            launcher.launch(&spec(), "t1-service").await,
            Err(ControllerError::InvalidSpec(_))
        ));
        assert!(matches!(
            launcher.launch(&spec(), "t1-service").await,
            Err(ControllerError::SubstrateUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_substrate_unavailable() {
        let (substrate, launcher) = setup(Duration::from_millis(20));
        substrate.delay(Operation::Launch, Duration::from_millis(500));

        let err = launcher.launch(&spec(), "t1-service").await.unwrap_err();
        assert!(matches!(err, ControllerError::SubstrateUnavailable(_)));
    }
}
