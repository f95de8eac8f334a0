use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::lib::error::{ControllerError, ControllerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SubstrateKind {
    /// Local Docker daemon with NVIDIA device requests.
    Docker,
    /// In-process substrate that runs nothing; useful for demos and tests.
    Memory,
}

/// Process-level settings, read once at startup.
#[derive(Debug, Clone, Parser)]
#[command(name = "gpu-pool")]
#[command(about = "CPU/GPU pool admission control and task lifecycle controller")]
#[command(version)]
pub struct ControllerConfig {
    /// Address the HTTP API listens on
    #[arg(long, env = "GPU_POOL_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Execution substrate backing the tasks
    #[arg(long, env = "GPU_POOL_SUBSTRATE", value_enum, default_value = "docker")]
    pub substrate: SubstrateKind,

    /// Host name placed in service and access URLs
    #[arg(long, env = "GPU_POOL_PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// First node port that may be assigned
    #[arg(long, env = "GPU_POOL_PORT_RANGE_START", default_value_t = 30000)]
    pub port_range_start: u16,

    /// Last node port that may be assigned
    #[arg(long, env = "GPU_POOL_PORT_RANGE_END", default_value_t = 32767)]
    pub port_range_end: u16,

    /// Port the workload listens on inside its container
    #[arg(long, env = "GPU_POOL_CONTAINER_PORT", default_value_t = 8888)]
    pub container_port: u16,

    /// Override the discovered number of allocatable CPUs
    #[arg(long, env = "GPU_POOL_CPUS")]
    pub cpus: Option<u32>,

    /// Override the discovered number of allocatable GPUs
    #[arg(long, env = "GPU_POOL_GPUS")]
    pub gpus: Option<u32>,

    /// Deadline for each call into the execution substrate
    #[arg(long, env = "GPU_POOL_SUBSTRATE_TIMEOUT_SECS", default_value_t = 60)]
    pub substrate_timeout_secs: u64,

    /// Lifetime of an issued access link
    #[arg(long, env = "GPU_POOL_TOKEN_TTL_SECS", default_value_t = 3600)]
    pub token_ttl_secs: u64,

    /// Random bytes per access token (hex encoded in the URL)
    #[arg(long, env = "GPU_POOL_TOKEN_BYTES", default_value_t = 24)]
    pub token_bytes: usize,

    /// Do not expose tasks automatically when they are created
    #[arg(long, env = "GPU_POOL_NO_EXPOSE_ON_CREATE")]
    pub no_expose_on_create: bool,

    /// Allowed CORS origin (repeatable); any origin when omitted
    #[arg(long = "cors-origin", env = "GPU_POOL_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            substrate: SubstrateKind::Docker,
            public_host: "localhost".to_string(),
            port_range_start: 30000,
            port_range_end: 32767,
            container_port: 8888,
            cpus: None,
            gpus: None,
            substrate_timeout_secs: 60,
            token_ttl_secs: 3600,
            token_bytes: 24,
            no_expose_on_create: false,
            cors_origins: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> ControllerResult<()> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(ControllerError::InvalidInput(format!(
                "invalid node port range {}-{}",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.substrate_timeout_secs == 0 {
            return Err(ControllerError::InvalidInput(
                "substrate timeout must be positive".to_string(),
            ));
        }
        if self.token_bytes < 16 {
            return Err(ControllerError::InvalidInput(format!(
                "access tokens need at least 16 random bytes, got {}",
                self.token_bytes
            )));
        }
        if self.public_host.trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "public host must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn substrate_timeout(&self) -> Duration {
        Duration::from_secs(self.substrate_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn expose_on_create(&self) -> bool {
        !self.no_expose_on_create
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli_defaults() {
        let parsed = ControllerConfig::parse_from(["gpu-pool"]);
        let default = ControllerConfig::default();
        assert_eq!(parsed.bind, default.bind);
        assert_eq!(parsed.port_range(), default.port_range());
        assert_eq!(parsed.container_port, 8888);
        assert_eq!(parsed.substrate, SubstrateKind::Docker);
        assert!(parsed.expose_on_create());
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides() {
        let parsed = ControllerConfig::parse_from([
            "gpu-pool",
            "--substrate",
            "memory",
            "--cpus",
            "8",
            "--gpus",
            "2",
            "--port-range-start",
            "30080",
            "--port-range-end",
            "30090",
            "--no-expose-on-create",
            "--cors-origin",
            "http://localhost:3000",
        ]);
        assert_eq!(parsed.substrate, SubstrateKind::Memory);
        assert_eq!(parsed.cpus, Some(8));
        assert_eq!(parsed.gpus, Some(2));
        assert_eq!(parsed.port_range(), 30080..=30090);
        assert!(!parsed.expose_on_create());
        assert_eq!(parsed.cors_origins, vec!["http://localhost:3000".to_string()]);
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let config = ControllerConfig {
            port_range_start: 31000,
            port_range_end: 30000,
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ControllerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_rejects_short_tokens() {
        let config = ControllerConfig {
            token_bytes: 4,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
