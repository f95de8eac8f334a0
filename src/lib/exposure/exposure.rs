use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::lib::error::{ControllerError, ControllerResult};
use crate::lib::substrate::types::{Substrate, WorkloadHandle};
use crate::lib::substrate::with_deadline;
use crate::lib::tasks::types::Task;

/// Assigns node ports to tasks and asks the substrate to bind them.
pub struct ExposureManager {
    range: RangeInclusive<u16>,
    /// node port -> owning task name
    bindings: Mutex<BTreeMap<u16, String>>,
    substrate: Arc<dyn Substrate>,
    deadline: Duration,
}

impl ExposureManager {
    pub fn new(range: RangeInclusive<u16>, substrate: Arc<dyn Substrate>, deadline: Duration) -> Self {
        ExposureManager {
            range,
            bindings: Mutex::new(BTreeMap::new()),
            substrate,
            deadline,
        }
    }

    /// Binds the task to `preferred`, or to the lowest free port when none is
    /// given. Re-exposing on a different port replaces the old mapping; the
    /// task's current port is returned unchanged when it already matches.
    pub async fn expose(&self, task: &Task, preferred: Option<u16>) -> ControllerResult<u16> {
        let handle = task.handle.as_ref().ok_or_else(|| {
            ControllerError::ConsistencyViolation(format!("task '{}' has no workload handle", task.name))
        })?;
        if task.is_exposed() && preferred.is_none_or(|port| port == task.node_port) {
            return Ok(task.node_port);
        }

        let port = self.reserve(&task.name, preferred)?;
        if let Err(e) = with_deadline(self.deadline, "publish", self.substrate.publish(handle, port)).await {
            self.free(port, &task.name);
            warn!(task = %task.name, port, error = %e, "publish failed");
            return Err(e);
        }

        if task.is_exposed() {
            self.release_port(&task.name, handle, task.node_port).await;
        }
        info!(task = %task.name, port, "exposed");
        Ok(port)
    }

    /// Unbinds the task's port. The binding is kept if the substrate refuses,
    /// so a retry can try again.
    pub async fn unexpose(&self, task: &Task) -> ControllerResult<()> {
        if !task.is_exposed() {
            return Ok(());
        }
        if let Some(handle) = &task.handle {
            with_deadline(
                self.deadline,
                "unpublish",
                self.substrate.unpublish(handle, task.node_port),
            )
            .await?;
        }
        self.free(task.node_port, &task.name);
        info!(task = %task.name, port = task.node_port, "unexposed");
        Ok(())
    }

    #[cfg(test)]
    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.bindings.lock().get(&port).cloned()
    }

    #[cfg(test)]
    pub fn bound_count(&self) -> usize {
        self.bindings.lock().len()
    }

    fn reserve(&self, task: &str, preferred: Option<u16>) -> ControllerResult<u16> {
        let mut bindings = self.bindings.lock();
        let port = match preferred {
            Some(port) => {
                if !self.range.contains(&port) {
                    return Err(ControllerError::InvalidInput(format!(
                        "port {port} is outside the allowed range {}-{}",
                        self.range.start(),
                        self.range.end()
                    )));
                }
                if bindings.get(&port).is_some_and(|owner| owner != task) {
                    return Err(ControllerError::PortInUse(port));
                }
                port
            }
            None => self
                .range
                .clone()
                .find(|port| !bindings.contains_key(port))
                .ok_or(ControllerError::PortsExhausted {
                    start: *self.range.start(),
                    end: *self.range.end(),
                })?,
        };
        bindings.insert(port, task.to_string());
        Ok(port)
    }

    fn free(&self, port: u16, task: &str) {
        let mut bindings = self.bindings.lock();
        if bindings.get(&port).is_some_and(|owner| owner == task) {
            bindings.remove(&port);
        }
    }

    async fn release_port(&self, task: &str, handle: &WorkloadHandle, port: u16) {
        if let Err(e) = with_deadline(self.deadline, "unpublish", self.substrate.unpublish(handle, port)).await {
            warn!(task, port, error = %e, "old port mapping could not be removed");
        }
        self.free(port, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::ledger::types::Resources;
    use crate::lib::substrate::memory::{MemorySubstrate, Operation};
    use crate::lib::substrate::types::{LaunchRequest, SubstrateError};
    use crate::lib::tasks::types::{TaskSpec, TaskState};

    struct Fixture {
        substrate: Arc<MemorySubstrate>,
        exposure: ExposureManager,
    }

    fn fixture(range: RangeInclusive<u16>) -> Fixture {
        let substrate = Arc::new(MemorySubstrate::new(Resources::new(8, 2)));
        let exposure = ExposureManager::new(range, substrate.clone(), Duration::from_secs(5));
        Fixture { substrate, exposure }
    }

    async fn running_task(substrate: &MemorySubstrate, name: &str) -> Task {
        let spec = TaskSpec::new(name, "jupyter/base-notebook", 1, 0).unwrap();
        let mut task = Task::pending(&spec);
        let handle = substrate
            .launch(&LaunchRequest {
                name: spec.name.clone(),
                image: spec.image.clone(),
                resources: spec.resources,
                service_name: task.service_name.clone(),
                container_port: 8888,
            })
            .await
            .unwrap();
        task.handle = Some(handle);
        task.state = TaskState::Running;
        task
    }

    #[tokio::test]
    async fn test_lowest_free_port() {
        let f = fixture(30000..=30010);
        let a = running_task(&f.substrate, "a").await;
        let b = running_task(&f.substrate, "b").await;

        assert_eq!(f.exposure.expose(&a, None).await.unwrap(), 30000);
        assert_eq!(f.exposure.expose(&b, None).await.unwrap(), 30001);
        assert_eq!(f.exposure.owner_of(30001).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_preferred_port_conflict() {
        let f = fixture(30000..=32767);
        let t1 = running_task(&f.substrate, "t1").await;
        let t2 = running_task(&f.substrate, "t2").await;

        assert_eq!(f.exposure.expose(&t1, Some(30080)).await.unwrap(), 30080);
        assert!(matches!(
            f.exposure.expose(&t2, Some(30080)).await,
            Err(ControllerError::PortInUse(30080))
        ));
        assert_eq!(f.exposure.expose(&t2, Some(30081)).await.unwrap(), 30081);
    }

    #[tokio::test]
    async fn test_out_of_range_port() {
        let f = fixture(30000..=32767);
        let t1 = running_task(&f.substrate, "t1").await;
        assert!(matches!(
            f.exposure.expose(&t1, Some(8080)).await,
            Err(ControllerError::InvalidInput(_))
        ));
        assert_eq!(f.exposure.bound_count(), 0);
    }

    #[tokio::test]
    async fn test_reexpose_replaces_mapping() {
        let f = fixture(30000..=32767);
        let mut t1 = running_task(&f.substrate, "t1").await;
        t1.node_port = f.exposure.expose(&t1, Some(30080)).await.unwrap();

        // same port again is a no-op
        assert_eq!(f.exposure.expose(&t1, Some(30080)).await.unwrap(), 30080);
        assert_eq!(f.exposure.expose(&t1, None).await.unwrap(), 30080);

        let new_port = f.exposure.expose(&t1, Some(30090)).await.unwrap();
        assert_eq!(new_port, 30090);
        assert!(f.exposure.owner_of(30080).is_none());
        assert!(!f.substrate.published_ports().contains(&30080));
        assert!(f.substrate.published_ports().contains(&30090));
    }

    #[tokio::test]
    async fn test_publish_failure_frees_reservation() {
        let f = fixture(30000..=32767);
        let t1 = running_task(&f.substrate, "t1").await;
        f.substrate.fail_next(Operation::Publish, SubstrateError::PortUnavailable(30000));

        assert!(matches!(
            f.exposure.expose(&t1, None).await,
            Err(ControllerError::PortInUse(30000))
        ));
        assert_eq!(f.exposure.bound_count(), 0);
    }

    #[tokio::test]
    async fn test_range_exhaustion() {
        let f = fixture(30000..=30000);
        let a = running_task(&f.substrate, "a").await;
        let b = running_task(&f.substrate, "b").await;
        f.exposure.expose(&a, None).await.unwrap();

        assert!(matches!(
            f.exposure.expose(&b, None).await,
            Err(ControllerError::PortsExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_unexpose() {
        let f = fixture(30000..=32767);
        let mut t1 = running_task(&f.substrate, "t1").await;
        t1.node_port = f.exposure.expose(&t1, None).await.unwrap();

        f.exposure.unexpose(&t1).await.unwrap();
        assert_eq!(f.exposure.bound_count(), 0);
        assert!(f.substrate.published_ports().is_empty());
    }
}
