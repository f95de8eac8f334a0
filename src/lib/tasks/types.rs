use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lib::error::{ControllerError, ControllerResult};
use crate::lib::ledger::types::Resources;
use crate::lib::substrate::types::WorkloadHandle;

const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Ledger reserved, launch not yet confirmed.
    Pending,
    Running,
    Exposed,
    Terminating,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Exposed => write!(f, "EXPOSED"),
            Self::Terminating => write!(f, "TERMINATING"),
        }
    }
}

/// How a task's service is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureKind {
    None,
    NodePort,
    /// Exposed and at least one access token has been issued for it.
    TokenizedHttp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    pub image: String,
    pub cpus: u32,
    pub gpus: u32,
    #[serde(skip)]
    pub handle: Option<WorkloadHandle>,
    pub service_name: String,
    /// 0 while unexposed.
    pub node_port: u16,
    pub state: TaskState,
    pub exposure_kind: ExposureKind,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn pending(spec: &TaskSpec) -> Self {
        Task {
            name: spec.name.clone(),
            image: spec.image.clone(),
            cpus: spec.resources.cpus,
            gpus: spec.resources.gpus,
            handle: None,
            service_name: service_name_for(&spec.name),
            node_port: 0,
            state: TaskState::Pending,
            exposure_kind: ExposureKind::None,
            created_at: Utc::now(),
        }
    }

    pub fn resources(&self) -> Resources {
        Resources::new(self.cpus, self.gpus)
    }

    pub fn is_exposed(&self) -> bool {
        self.node_port != 0
    }
}

/// A validated create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub image: String,
    pub resources: Resources,
}

impl TaskSpec {
    pub fn new(name: &str, image: &str, cpus: u32, gpus: u32) -> ControllerResult<Self> {
        let name = normalize_task_name(name)?;
        let image = image.trim();
        if image.is_empty() {
            return Err(ControllerError::InvalidInput("imageName is required".to_string()));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(ControllerError::InvalidInput(format!(
                "image reference '{image}' contains whitespace"
            )));
        }
        let resources = Resources::new(cpus, gpus);
        validate_grant(&resources)?;
        Ok(TaskSpec {
            name,
            image: image.to_string(),
            resources,
        })
    }
}

/// A task holds at least one CPU; GPUs are optional.
pub fn validate_grant(resources: &Resources) -> ControllerResult<()> {
    if resources.cpus == 0 {
        return Err(ControllerError::InvalidInput(
            "cpus must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

/// Lower-cases and dashes a client-supplied name, then requires a DNS-1123 label.
pub fn normalize_task_name(raw: &str) -> ControllerResult<String> {
    let name = raw.trim().to_lowercase().replace(' ', "-");
    if name.is_empty() {
        return Err(ControllerError::InvalidInput("taskName is required".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ControllerError::InvalidInput(format!(
            "taskName '{name}' is longer than {MAX_NAME_LEN} characters"
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(ControllerError::InvalidInput(format!(
            "taskName '{name}' must contain only a-z, 0-9 and '-', and start and end alphanumeric"
        )));
    }
    Ok(name)
}

pub fn service_name_for(task_name: &str) -> String {
    format!("{task_name}-service")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("t1", "t1" ; "already normalized")]
    #[test_case("My Notebook", "my-notebook" ; "spaces and case")]
    #[test_case("  Train 01 ", "train-01" ; "surrounding whitespace")]
    fn test_normalize_accepts(raw: &str, expected: &str) {
        assert_eq!(normalize_task_name(raw).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("-lead" ; "leading dash")]
    #[test_case("trail-" ; "trailing dash")]
    #[test_case("under_score" ; "underscore")]
    #[test_case("dots.are.bad" ; "dots")]
    fn test_normalize_rejects(raw: &str) {
        assert!(matches!(
            normalize_task_name(raw),
            Err(ControllerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_name_length_limit() {
        assert!(normalize_task_name(&"a".repeat(63)).is_ok());
        assert!(normalize_task_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_spec_validation() {
        let spec = TaskSpec::new("Notebook", "jupyter/base-notebook", 2, 0).unwrap();
        assert_eq!(spec.name, "notebook");
        assert_eq!(spec.resources, Resources::new(2, 0));

        assert!(TaskSpec::new("nb", "jupyter/base-notebook", 0, 1).is_err());
        assert!(TaskSpec::new("nb", "  ", 1, 0).is_err());
        assert!(TaskSpec::new("nb", "bad image", 1, 0).is_err());
    }

    #[test]
    fn test_pending_task_derives_service_name() {
        let spec = TaskSpec::new("t1", "pytorch/pytorch:latest", 4, 1).unwrap();
        let task = Task::pending(&spec);
        assert_eq!(task.service_name, "t1-service");
        assert_eq!(task.node_port, 0);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.exposure_kind, ExposureKind::None);
        assert!(task.handle.is_none());
    }
}
