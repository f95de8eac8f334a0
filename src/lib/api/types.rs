use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::lib::ledger::types::PoolSnapshot;
use crate::lib::manager::types::Manager;
use crate::lib::tasks::types::Task;

pub struct TaskServer {
    pub manager: Arc<Manager>,
    pub address: SocketAddr,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub task_name: String,
    pub image_name: String,
    #[serde(deserialize_with = "lenient_number")]
    pub cpus: u32,
    #[serde(deserialize_with = "lenient_number")]
    pub gpus: u32,
}

/// Absolute target grant for an existing task.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTaskRequest {
    pub task_name: String,
    #[serde(deserialize_with = "lenient_number")]
    pub cpus: u32,
    #[serde(deserialize_with = "lenient_number")]
    pub gpus: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub service_name: String,
    #[serde(deserialize_with = "lenient_number")]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenRequest {
    pub service_name: String,
    #[serde(deserialize_with = "lenient_number")]
    pub port: u16,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ResourcesResponse {
    #[serde(rename = "totalAllocatableGPUs")]
    pub total_gpus: u32,
    #[serde(rename = "freeGPUs")]
    pub free_gpus: u32,
    #[serde(rename = "totalAllocatableCPUs")]
    pub total_cpus: u32,
    #[serde(rename = "freeCPUs")]
    pub free_cpus: u32,
}

impl From<PoolSnapshot> for ResourcesResponse {
    fn from(snapshot: PoolSnapshot) -> Self {
        ResourcesResponse {
            total_gpus: snapshot.total.gpus,
            free_gpus: snapshot.free.gpus,
            total_cpus: snapshot.total.cpus,
            free_cpus: snapshot.free.cpus,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskNamesResponse {
    pub tasks: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub name: String,
    pub image_name: String,
    pub cpus: u32,
    pub gpus: u32,
    pub node_port: u16,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        TaskSummary {
            name: task.name,
            image_name: task.image,
            cpus: task.cpus,
            gpus: task.gpus,
            node_port: task.node_port,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub message: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "serviceURL")]
    pub service_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateTokenResponse {
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

/// Browser forms post numbers as strings; accept both.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let value = match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => n,
        NumberOrString::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("'{s}' is not a non-negative integer")))?,
    };
    T::try_from(value).map_err(|_| serde::de::Error::custom(format!("{value} is out of range")))
}
