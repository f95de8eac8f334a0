pub mod docker;
pub mod forward;
pub mod memory;
pub mod types;

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::lib::error::{ControllerError, ControllerResult};
use types::SubstrateError;

/// Runs one substrate call under a deadline. A timeout is reported as
/// `SubstrateUnavailable` so callers roll back like any transient failure.
pub async fn with_deadline<T, F>(deadline: Duration, operation: &str, call: F) -> ControllerResult<T>
where
    F: Future<Output = Result<T, SubstrateError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result.map_err(ControllerError::from),
        Err(_) => {
            warn!(operation, ?deadline, "substrate call timed out");
            Err(ControllerError::SubstrateUnavailable(format!(
                "{operation} timed out after {}s",
                deadline.as_secs_f32()
            )))
        }
    }
}
