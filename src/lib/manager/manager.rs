use std::sync::Arc;

use tracing::{error, info, warn};

use super::types::{CreatedTask, Manager};
use crate::lib::access::types::{AccessLink, CredentialIssuer};
use crate::lib::config::ControllerConfig;
use crate::lib::error::{ControllerError, ControllerResult};
use crate::lib::exposure::exposure::ExposureManager;
use crate::lib::launcher::launcher::Launcher;
use crate::lib::ledger::types::{Ledger, PoolSnapshot, Resources};
use crate::lib::substrate::types::Substrate;
use crate::lib::tasks::registry::{TaskGuard, TaskRegistry};
use crate::lib::tasks::types::{
    ExposureKind, Task, TaskSpec, TaskState, normalize_task_name, validate_grant,
};

impl Manager {
    pub fn new(config: &ControllerConfig, substrate: Arc<dyn Substrate>, capacity: Resources) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let deadline = config.substrate_timeout();
        info!(%capacity, substrate = substrate.name(), "resource pool initialised");

        Manager {
            ledger: Arc::new(Ledger::new(capacity)),
            registry: registry.clone(),
            launcher: Launcher::new(substrate.clone(), deadline, config.container_port),
            exposure: ExposureManager::new(config.port_range(), substrate, deadline),
            issuer: CredentialIssuer::new(
                registry,
                &config.public_host,
                config.token_ttl(),
                config.token_bytes,
            ),
            public_host: config.public_host.clone(),
            expose_on_create: config.expose_on_create(),
        }
    }

    /// Validate, reserve, launch, record. A failed launch releases the
    /// reservation and discards the pending entry.
    pub async fn create_task(
        self: &Arc<Self>,
        name: &str,
        image: &str,
        cpus: u32,
        gpus: u32,
    ) -> ControllerResult<CreatedTask> {
        let spec = TaskSpec::new(name, image, cpus, gpus)?;
        let manager = self.clone();
        detached(async move { manager.run_create(spec).await }).await
    }

    async fn run_create(&self, spec: TaskSpec) -> ControllerResult<CreatedTask> {
        let mut guard = self.registry.begin_create(&spec)?;

        if let Err(e) = self.ledger.reserve(spec.resources) {
            self.registry.remove(guard);
            info!(task = %spec.name, error = %e, "create rejected");
            return Err(e);
        }

        let service_name = guard.service_name.clone();
        let handle = match self.launcher.launch(&spec, &service_name).await {
            Ok(handle) => handle,
            Err(e) => {
                self.rollback_create(guard, spec.resources);
                return Err(e);
            }
        };
        guard.handle = Some(handle);
        guard.transition(TaskState::Running)?;
        guard.publish();
        info!(task = %spec.name, resources = %spec.resources, "task running");

        let mut service_url = None;
        if self.expose_on_create {
            match self.exposure.expose(&guard, None).await {
                Ok(port) => {
                    Self::mark_exposed(&mut guard, port)?;
                    service_url = Some(self.service_url(port));
                }
                Err(e) => {
                    warn!(task = %spec.name, error = %e, "task created but could not be exposed");
                }
            }
        }

        Ok(CreatedTask {
            task: guard.snapshot(),
            service_url,
        })
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.registry.list()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.registry.list().into_iter().map(|task| task.name).collect()
    }

    pub fn get_task(&self, name: &str) -> ControllerResult<Task> {
        self.registry.get(&normalize_task_name(name)?)
    }

    pub fn available_resources(&self) -> PoolSnapshot {
        self.ledger.snapshot()
    }

    /// Moves a task's grant to an absolute target. The ledger is adjusted by the
    /// delta only and restored if the substrate refuses the new limits.
    pub async fn resize_task(self: &Arc<Self>, name: &str, cpus: u32, gpus: u32) -> ControllerResult<Task> {
        let name = normalize_task_name(name)?;
        let target = Resources::new(cpus, gpus);
        validate_grant(&target)?;
        let manager = self.clone();
        detached(async move { manager.run_resize(&name, target).await }).await
    }

    async fn run_resize(&self, name: &str, target: Resources) -> ControllerResult<Task> {
        let mut guard = self.registry.lock(name).await?;
        let state = guard.state;
        guard.check_transition(state)?;
        let handle = guard.handle.clone().ok_or_else(|| {
            ControllerError::ConsistencyViolation(format!("task '{}' is {state} without a workload", guard.name))
        })?;

        let current = guard.resources();
        if current == target {
            return Ok(guard.snapshot());
        }

        self.ledger.resize(current, target)?;
        if let Err(e) = self.launcher.resize(&guard.name, &handle, target).await {
            warn!(task = %guard.name, error = %e, "resize failed, restoring ledger");
            if let Err(undo) = self.ledger.resize(target, current) {
                error!(task = %guard.name, error = %undo, "ledger could not be restored after failed resize");
            }
            return Err(e);
        }

        guard.cpus = target.cpus;
        guard.gpus = target.gpus;
        info!(task = %guard.name, from = %current, to = %target, "task resized");
        Ok(guard.snapshot())
    }

    /// Unexpose, tear down, release, forget. A failed step leaves the task in
    /// `TERMINATING` with whatever is still held, so calling again resumes.
    pub async fn delete_task(self: &Arc<Self>, name: &str) -> ControllerResult<Task> {
        let name = normalize_task_name(name)?;
        let manager = self.clone();
        detached(async move { manager.run_delete(&name).await }).await
    }

    async fn run_delete(&self, name: &str) -> ControllerResult<Task> {
        let mut guard = self.registry.lock(name).await?;
        if guard.state != TaskState::Terminating {
            guard.transition(TaskState::Terminating)?;
            guard.publish();
        }

        if guard.is_exposed() {
            self.exposure.unexpose(&guard).await?;
            guard.node_port = 0;
            guard.exposure_kind = ExposureKind::None;
        }
        if let Some(handle) = guard.handle.clone() {
            self.launcher.terminate(&guard.name, &handle).await?;
            guard.handle = None;
        }
        self.ledger.release(guard.resources())?;

        self.issuer.revoke_service(&guard.service_name);
        let task = self.registry.remove(guard);
        info!(task = %task.name, released = %task.resources(), "task deleted");
        Ok(task)
    }

    /// Binds the task to `preferred` or the lowest free port.
    pub async fn expose_task(self: &Arc<Self>, name: &str, preferred: Option<u16>) -> ControllerResult<Task> {
        let name = normalize_task_name(name)?;
        let manager = self.clone();
        detached(async move {
            let mut guard = manager.registry.lock(&name).await?;
            manager.expose_locked(&mut guard, preferred).await?;
            Ok::<_, ControllerError>(guard.snapshot())
        })
        .await
    }

    /// Exposes the service on `port` (moving it there if it is bound elsewhere)
    /// and issues a fresh access link for that mapping.
    pub async fn access_link(self: &Arc<Self>, service_name: &str, port: u16) -> ControllerResult<AccessLink> {
        let service_name = service_name.to_string();
        let manager = self.clone();
        detached(async move { manager.run_access_link(&service_name, port).await }).await
    }

    async fn run_access_link(&self, service_name: &str, port: u16) -> ControllerResult<AccessLink> {
        let task = self
            .registry
            .find_by_service(service_name)
            .ok_or_else(|| ControllerError::ServiceNotExposed {
                service: service_name.to_string(),
                port,
            })?;

        {
            let mut guard = self.registry.lock(&task.name).await?;
            self.expose_locked(&mut guard, Some(port)).await?;
            guard.exposure_kind = ExposureKind::TokenizedHttp;
        }
        self.issuer.issue(service_name, port)
    }

    pub fn validate_token(&self, service_name: &str, port: u16, token: &str) -> bool {
        self.issuer.validate(service_name, port, token)
    }

    pub fn service_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.public_host)
    }

    async fn expose_locked(&self, guard: &mut TaskGuard, preferred: Option<u16>) -> ControllerResult<u16> {
        guard.check_transition(TaskState::Exposed)?;
        let previous = guard.node_port;
        let port = self.exposure.expose(&**guard, preferred).await?;
        Self::mark_exposed(guard, port)?;
        if previous != 0 && previous != port {
            self.issuer.revoke_port(&guard.service_name, previous);
            info!(task = %guard.name, from = previous, to = port, "exposure moved");
        }
        Ok(port)
    }

    fn mark_exposed(guard: &mut TaskGuard, port: u16) -> ControllerResult<()> {
        guard.transition(TaskState::Exposed)?;
        guard.node_port = port;
        if guard.exposure_kind == ExposureKind::None {
            guard.exposure_kind = ExposureKind::NodePort;
        }
        Ok(())
    }

    fn rollback_create(&self, guard: TaskGuard, reserved: Resources) {
        if let Err(e) = self.ledger.release(reserved) {
            error!(task = %guard.name, error = %e, "reservation could not be released after failed launch");
        }
        let task = self.registry.remove(guard);
        info!(task = %task.name, %reserved, "create rolled back");
    }
}

/// Runs a mutating operation on its own task, so a dropped caller (a client
/// disconnecting mid-request) cannot stop it between a ledger change and the
/// registry update that matches it.
async fn detached<T, F>(operation: F) -> ControllerResult<T>
where
    T: Send + 'static,
    F: Future<Output = ControllerResult<T>> + Send + 'static,
{
    tokio::spawn(operation).await.map_err(|e| {
        let err = ControllerError::ConsistencyViolation(format!("operation aborted: {e}"));
        error!(error = %err, "detached operation did not complete");
        err
    })?
}
