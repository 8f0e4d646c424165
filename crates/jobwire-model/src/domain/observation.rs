use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{ExitInfo, JobId, JobState, time_serde};

/// One job state as reported by the batch scheduler adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobObservation {
    pub job_id: JobId,
    pub state: JobState,
    /// When the scheduler says the job entered `state`.
    #[serde(with = "time_serde")]
    pub timestamp: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<ExitInfo>,
}

impl JobObservation {
    pub fn new(job_id: impl Into<JobId>, state: JobState, timestamp: SystemTime) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            timestamp,
            exit_info: None,
        }
    }

    pub fn with_exit(mut self, exit_info: ExitInfo) -> Self {
        self.exit_info = Some(exit_info);
        self
    }
}
