use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, UpdateContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{DeviceRequest, HostConfig, RestartPolicy, RestartPolicyNameEnum},
};
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::forward::PortForwarder;
use super::types::{LaunchRequest, Substrate, SubstrateError, WorkloadHandle};
use crate::lib::ledger::capacity::count_nvidia_devices;
use crate::lib::ledger::types::Resources;

const STOP_TIMEOUT_SECS: i64 = 10;
const LABEL_APP: &str = "app";
const LABEL_SERVICE: &str = "gpu-pool.service";

/// Runs tasks as containers on the local Docker daemon.
pub struct DockerSubstrate {
    client: Docker,
    container_port: u16,
    forwarders: Mutex<HashMap<u16, (String, PortForwarder)>>,
}

impl DockerSubstrate {
    pub fn connect(container_port: u16) -> Result<Self, SubstrateError> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            SubstrateError::Unavailable(format!("failed to connect to Docker: {e}"))
        })?;

        Ok(DockerSubstrate {
            client,
            container_port,
            forwarders: Mutex::new(HashMap::new()),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), SubstrateError> {
        info!(image, "pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, %status, "pull progress");
                    }
                }
                Err(e) => return Err(classify(e, &format!("pull {image}"))),
            }
        }

        info!(image, "image pulled");
        Ok(())
    }

    fn container_config(&self, request: &LaunchRequest) -> Config<String> {
        let restart_policy = RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        };

        let mut host_config = HostConfig {
            restart_policy: Some(restart_policy),
            nano_cpus: Some(nano_cpus(request.resources.cpus)),
            ..Default::default()
        };
        if request.resources.gpus > 0 {
            host_config.device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(i64::from(request.resources.gpus)),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
        }

        let labels = HashMap::from([
            (LABEL_APP.to_string(), request.name.clone()),
            (LABEL_SERVICE.to_string(), request.service_name.clone()),
        ]);

        Config {
            image: Some(request.image.clone()),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(
                format!("{}/tcp", request.container_port),
                HashMap::new(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn container_address(&self, id: &str) -> Result<Option<String>, SubstrateError> {
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, &format!("inspect {id}")))?;

        let Some(network) = inspect.network_settings else {
            return Ok(None);
        };
        let primary = network.ip_address.filter(|ip| !ip.is_empty());
        let any_network = network.networks.and_then(|networks| {
            networks
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
        });
        Ok(primary.or(any_network))
    }

    async fn remove_container(&self, id: &str) -> Result<(), SubstrateError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Ok(()),
            Err(e) => Err(classify(e, &format!("remove {id}"))),
        }
    }

    fn drop_forwarders(&self, handle_id: &str) {
        self.forwarders
            .lock()
            .retain(|_, (owner, _)| owner.as_str() != handle_id);
    }
}

#[async_trait]
impl Substrate for DockerSubstrate {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn capacity(&self) -> Result<Resources, SubstrateError> {
        let info = self
            .client
            .info()
            .await
            .map_err(|e| classify(e, "docker info"))?;
        let cpus = info.ncpu.unwrap_or_default().max(0) as u32;
        Ok(Resources::new(cpus, count_nvidia_devices(Path::new("/dev"))))
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkloadHandle, SubstrateError> {
        self.pull_image(&request.image).await?;

        let options = Some(CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        });
        let created = self
            .client
            .create_container(options, self.container_config(request))
            .await
            .map_err(|e| classify(e, &format!("create container {}", request.name)))?;
        info!(task = %request.name, container = %created.id, "container created");

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(task = %request.name, error = %e, "start failed, removing container");
            if let Err(cleanup) = self.remove_container(&created.id).await {
                warn!(container = %created.id, error = %cleanup, "cleanup after failed start failed");
            }
            return Err(classify(e, &format!("start container {}", request.name)));
        }

        let address = self.container_address(&created.id).await?;
        info!(task = %request.name, container = %created.id, ?address, "container started");
        Ok(WorkloadHandle {
            id: created.id,
            address,
        })
    }

    async fn terminate(&self, handle: &WorkloadHandle) -> Result<(), SubstrateError> {
        self.drop_forwarders(&handle.id);

        let stop = self
            .client
            .stop_container(
                &handle.id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await;
        match stop {
            Ok(()) => {}
            // already stopped or already gone
            Err(e) if matches!(status_of(&e), Some(304 | 404)) => {}
            Err(e) => return Err(classify(e, &format!("stop {}", handle.id))),
        }

        self.remove_container(&handle.id).await?;
        info!(container = %handle.id, "container removed");
        Ok(())
    }

    async fn resize(
        &self,
        handle: &WorkloadHandle,
        resources: Resources,
    ) -> Result<(), SubstrateError> {
        let options = UpdateContainerOptions::<String> {
            nano_cpus: Some(nano_cpus(resources.cpus)),
            ..Default::default()
        };
        self.client
            .update_container(&handle.id, options)
            .await
            .map_err(|e| classify(e, &format!("update {}", handle.id)))?;
        // Device requests are fixed when the container is created.
        info!(
            container = %handle.id,
            cpus = resources.cpus,
            gpus = resources.gpus,
            "CPU limit updated; GPU device set applies on next restart"
        );
        Ok(())
    }

    async fn publish(&self, handle: &WorkloadHandle, node_port: u16) -> Result<(), SubstrateError> {
        let ip: IpAddr = handle
            .address
            .as_deref()
            .ok_or_else(|| {
                SubstrateError::Unavailable(format!("container {} has no address", handle.id))
            })?
            .parse()
            .map_err(|e| SubstrateError::Unavailable(format!("bad container address: {e}")))?;
        let target = SocketAddr::new(ip, self.container_port);
        let listen = SocketAddr::from(([0, 0, 0, 0], node_port));

        let forwarder = PortForwarder::spawn(listen, target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                SubstrateError::PortUnavailable(node_port)
            } else {
                SubstrateError::Unavailable(format!("bind {listen}: {e}"))
            }
        })?;
        debug!(container = %handle.id, listen = %forwarder.local_addr(), "node port published");
        self.forwarders
            .lock()
            .insert(node_port, (handle.id.clone(), forwarder));
        Ok(())
    }

    async fn unpublish(
        &self,
        handle: &WorkloadHandle,
        node_port: u16,
    ) -> Result<(), SubstrateError> {
        let mut forwarders = self.forwarders.lock();
        if forwarders
            .get(&node_port)
            .is_some_and(|(owner, _)| owner == &handle.id)
        {
            forwarders.remove(&node_port);
        }
        Ok(())
    }
}

fn nano_cpus(cpus: u32) -> i64 {
    i64::from(cpus) * 1_000_000_000
}

fn status_of(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// 400/404 from the daemon mean the request itself is wrong (unknown image,
/// bad reference); anything else may succeed on retry.
fn classify(err: DockerError, context: &str) -> SubstrateError {
    match status_of(&err) {
        Some(400 | 404) => SubstrateError::InvalidSpec(format!("{context}: {err}")),
        _ => SubstrateError::Unavailable(format!("{context}: {err}")),
    }
}
