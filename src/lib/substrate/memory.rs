use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::types::{LaunchRequest, Substrate, SubstrateError, WorkloadHandle};
use crate::lib::ledger::types::Resources;

/// Which call a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Launch,
    Terminate,
    Resize,
    Publish,
    Unpublish,
}

#[derive(Debug, Clone)]
pub struct MemoryWorkload {
    pub request: LaunchRequest,
    pub resources: Resources,
    pub ports: HashSet<u16>,
}

#[derive(Default)]
struct MemoryState {
    workloads: HashMap<String, MemoryWorkload>,
    faults: HashMap<Operation, VecDeque<SubstrateError>>,
    delays: HashMap<Operation, Duration>,
}

/// Bookkeeping-only substrate: workloads exist as records, nothing executes.
/// Failures and slow calls can be scripted per operation.
pub struct MemorySubstrate {
    capacity: Resources,
    state: Mutex<MemoryState>,
}

impl MemorySubstrate {
    pub fn new(capacity: Resources) -> Self {
        MemorySubstrate {
            capacity,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Queues a failure for the next call of `operation`.
    #[cfg(test)]
    pub fn fail_next(&self, operation: Operation, err: SubstrateError) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    /// Makes every call of `operation` sleep first.
    #[cfg(test)]
    pub fn delay(&self, operation: Operation, by: Duration) {
        self.state.lock().delays.insert(operation, by);
    }

    #[cfg(test)]
    pub fn workloads(&self) -> Vec<MemoryWorkload> {
        self.state.lock().workloads.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn published_ports(&self) -> HashSet<u16> {
        self.state
            .lock()
            .workloads
            .values()
            .flat_map(|w| w.ports.iter().copied())
            .collect()
    }

    async fn enter(&self, operation: Operation) -> Result<(), SubstrateError> {
        let delay = self.state.lock().delays.get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self
            .state
            .lock()
            .faults
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn capacity(&self) -> Result<Resources, SubstrateError> {
        Ok(self.capacity)
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkloadHandle, SubstrateError> {
        self.enter(Operation::Launch).await?;
        let id = format!("mem-{}", uuid::Uuid::new_v4());
        self.state.lock().workloads.insert(
            id.clone(),
            MemoryWorkload {
                request: request.clone(),
                resources: request.resources,
                ports: HashSet::new(),
            },
        );
        info!(task = %request.name, handle = %id, "in-memory workload started");
        Ok(WorkloadHandle {
            id,
            address: Some("127.0.0.1".to_string()),
        })
    }

    async fn terminate(&self, handle: &WorkloadHandle) -> Result<(), SubstrateError> {
        self.enter(Operation::Terminate).await?;
        self.state.lock().workloads.remove(&handle.id);
        Ok(())
    }

    async fn resize(
        &self,
        handle: &WorkloadHandle,
        resources: Resources,
    ) -> Result<(), SubstrateError> {
        self.enter(Operation::Resize).await?;
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get_mut(&handle.id)
            .ok_or_else(|| SubstrateError::InvalidSpec(format!("unknown workload {}", handle.id)))?;
        workload.resources = resources;
        Ok(())
    }

    async fn publish(&self, handle: &WorkloadHandle, node_port: u16) -> Result<(), SubstrateError> {
        self.enter(Operation::Publish).await?;
        let mut state = self.state.lock();
        let taken = state.workloads.values().any(|w| w.ports.contains(&node_port));
        if taken {
            return Err(SubstrateError::PortUnavailable(node_port));
        }
        let workload = state
            .workloads
            .get_mut(&handle.id)
            .ok_or_else(|| SubstrateError::InvalidSpec(format!("unknown workload {}", handle.id)))?;
        workload.ports.insert(node_port);
        Ok(())
    }

    async fn unpublish(
        &self,
        handle: &WorkloadHandle,
        node_port: u16,
    ) -> Result<(), SubstrateError> {
        self.enter(Operation::Unpublish).await?;
        if let Some(workload) = self.state.lock().workloads.get_mut(&handle.id) {
            workload.ports.remove(&node_port);
        }
        Ok(())
    }
}
