//! Source of job states from the local batch system.

mod command;
pub use command::{CommandPoller, parse_line};

mod scripted;
pub use scripted::ScriptedPoller;

use std::time::SystemTime;

use async_trait::async_trait;
use jobwire_model::{JobId, JobObservation};

use crate::error::PollerError;

#[async_trait]
pub trait BatchPoller: Send + Sync {
    /// Every job the scheduler currently lists. The snapshot is owned by the caller.
    async fn current_states(&self) -> Result<Vec<JobObservation>, PollerError>;

    /// How a job that vanished from the listing ended, looked up in the
    /// scheduler's history from `since` onwards. `None` when history has no entry.
    async fn final_state(
        &self,
        job_id: &JobId,
        since: SystemTime,
    ) -> Result<Option<JobObservation>, PollerError>;
}
