use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized batch job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    /// Queued, waiting for resources.
    Idle,
    /// Executing on a worker node.
    Running,
    /// Held by the scheduler or an operator.
    Held,
    /// Finished (any exit code).
    Completed,
    /// Terminated by the batch system with an error.
    Failed,
    /// Removed before completion.
    Cancelled,
    /// The adapter could not map the native state.
    Unknown,
}

impl JobState {
    /// Returns `true` if the job is in a terminal state (won't transition further).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Returns `true` for every state except [`JobState::Unknown`].
    pub fn is_known(&self) -> bool {
        !matches!(self, JobState::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Held => "held",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for JobState {
    type Err = ParseStateError;

    /// Accepts state names (case-insensitive) and the classic numeric registry
    /// codes: `1` idle, `2` running, `3` cancelled, `4` completed, `5` held.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        match norm.as_str() {
            "idle" | "1" => Ok(JobState::Idle),
            "running" | "2" => Ok(JobState::Running),
            "cancelled" | "canceled" | "3" => Ok(JobState::Cancelled),
            "completed" | "4" => Ok(JobState::Completed),
            "held" | "5" => Ok(JobState::Held),
            "failed" => Ok(JobState::Failed),
            "unknown" | "0" => Ok(JobState::Unknown),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());

        assert!(!JobState::Idle.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Held.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
    }

    #[test]
    fn parse_names_and_codes() {
        assert_eq!("RUNNING".parse::<JobState>(), Ok(JobState::Running));
        assert_eq!(" held ".parse::<JobState>(), Ok(JobState::Held));
        assert_eq!("4".parse::<JobState>(), Ok(JobState::Completed));
        assert_eq!("canceled".parse::<JobState>(), Ok(JobState::Cancelled));
        assert!("exploded".parse::<JobState>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&JobState::Completed).unwrap();
        assert_eq!(json, r#""completed""#);

        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobState::Completed);
    }
}
