use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use super::types::{AccessLink, CredentialIssuer};
use crate::lib::error::{ControllerError, ControllerResult};
use crate::lib::tasks::registry::TaskRegistry;

impl CredentialIssuer {
    pub fn new(registry: Arc<TaskRegistry>, public_host: &str, ttl: Duration, token_bytes: usize) -> Self {
        CredentialIssuer {
            registry,
            public_host: public_host.to_string(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650)),
            token_bytes,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Mints a fresh token for a service that is currently bound to `port`.
    pub fn issue(&self, service_name: &str, port: u16) -> ControllerResult<AccessLink> {
        let exposed = self
            .registry
            .find_by_service(service_name)
            .is_some_and(|task| task.is_exposed() && task.node_port == port);
        if !exposed {
            return Err(ControllerError::ServiceNotExposed {
                service: service_name.to_string(),
                port,
            });
        }

        let token = self.generate_token();
        let issued_at = Utc::now();
        let link = AccessLink {
            service_name: service_name.to_string(),
            port,
            url: format!("http://{}:{port}/?token={token}", self.public_host),
            token,
            issued_at,
            expires_at: issued_at + self.ttl,
        };
        self.links
            .lock()
            .insert((service_name.to_string(), port), link.clone());
        info!(service = service_name, port, expires_at = %link.expires_at, "access link issued");
        Ok(link)
    }

    /// True only for the latest unexpired token of this service and port.
    pub fn validate(&self, service_name: &str, port: u16, token: &str) -> bool {
        let links = self.links.lock();
        let Some(link) = links.get(&(service_name.to_string(), port)) else {
            return false;
        };
        if link.is_expired_at(Utc::now()) {
            return false;
        }
        link.token.as_bytes().ct_eq(token.as_bytes()).into()
    }

    /// Forgets every link of a service, e.g. when its task is deleted.
    pub fn revoke_service(&self, service_name: &str) {
        let mut links = self.links.lock();
        let before = links.len();
        links.retain(|(service, _), _| service != service_name);
        debug!(service = service_name, revoked = before - links.len(), "access links revoked");
    }

    /// Forgets the link for one mapping, e.g. after the port was replaced.
    pub fn revoke_port(&self, service_name: &str, port: u16) {
        if self
            .links
            .lock()
            .remove(&(service_name.to_string(), port))
            .is_some()
        {
            debug!(service = service_name, port, "access link revoked");
        }
    }

    fn generate_token(&self) -> String {
        let mut bytes = vec![0u8; self.token_bytes];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}
