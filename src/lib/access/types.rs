use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::lib::tasks::registry::TaskRegistry;

/// A capability URL for one exposed service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLink {
    pub service_name: String,
    pub port: u16,
    pub url: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessLink {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct CredentialIssuer {
    pub(super) registry: Arc<TaskRegistry>,
    pub(super) public_host: String,
    pub(super) ttl: chrono::Duration,
    pub(super) token_bytes: usize,
    /// Latest link per (service, port); issuing again supersedes.
    pub(super) links: Mutex<HashMap<(String, u16), AccessLink>>,
}
