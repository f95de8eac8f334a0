use std::sync::Arc;

use crate::lib::access::types::CredentialIssuer;
use crate::lib::exposure::exposure::ExposureManager;
use crate::lib::launcher::launcher::Launcher;
use crate::lib::ledger::types::Ledger;
use crate::lib::tasks::registry::TaskRegistry;
use crate::lib::tasks::types::Task;

/// Single entry point for client operations. Owns the ledger/registry pair
/// and sequences every substrate call around them.
pub struct Manager {
    pub(super) ledger: Arc<Ledger>,
    pub(super) registry: Arc<TaskRegistry>,
    pub(super) launcher: Launcher,
    pub(super) exposure: ExposureManager,
    pub(super) issuer: CredentialIssuer,
    pub(super) public_host: String,
    pub(super) expose_on_create: bool,
}

/// Result of a successful create.
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: Task,
    /// `None` when the task could not be exposed right away.
    pub service_url: Option<String>,
}
