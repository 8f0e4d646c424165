//! Application messages carried inside wrapped tokens.
//!
//! ```text
//! agent                                   collector
//!   |  -- Update { seq, job_id, ... } -->     |
//!   |  -- Update { seq + 1, ... } ------->    |
//!   |  <-- Ack { seq + 1 } ----------------   |   (cumulative)
//! ```

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ExitInfo, JobId, JobState, Revision, time_serde};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// State update for one job, self-describing enough for last-write-wins by `revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    /// Per-endpoint sequence number used for acknowledgements.
    pub seq: u64,
    /// Reporting agent (host name).
    pub origin: String,
    pub job_id: JobId,
    pub revision: Revision,
    pub state: JobState,
    #[serde(with = "time_serde")]
    pub timestamp: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<ExitInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Update(JobUpdate),
    /// Every update with `seq <= self.seq` has been applied.
    Ack { seq: u64 },
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}
