use std::{
    process::Stdio,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use jobwire_model::{ExitInfo, JobId, JobObservation, JobState};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, trace};

use super::BatchPoller;
use crate::error::PollerError;

/// Poller backed by scheduler commands.
///
/// Both commands print one job per line: `job_id state unix_ts [exit_code]`.
/// Blank lines and lines starting with `#` are skipped. The history command
/// is invoked with the job id and the `since` unix timestamp appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandPoller {
    /// Listing command, argv form.
    pub list: Vec<String>,
    /// History command, argv form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<String>>,
}

impl CommandPoller {
    pub fn new(list: Vec<String>) -> Self {
        Self {
            list,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.history = Some(history);
        self
    }
}

async fn run(argv: &[String], extra: &[String]) -> Result<String, PollerError> {
    let command = argv.join(" ");
    let (program, args) = argv.split_first().ok_or_else(|| PollerError::Spawn {
        command: command.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
    })?;

    trace!(%command, "running scheduler command");
    let output = Command::new(program)
        .args(args)
        .args(extra)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| PollerError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(PollerError::Command {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse one scheduler line; `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<JobObservation>, PollerError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let bad = |reason: &str| PollerError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let mut fields = trimmed.split_whitespace();
    let (Some(id), Some(state), Some(ts)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(bad("expected `job_id state unix_ts [exit_code]`"));
    };
    let state: JobState = state.parse().map_err(|_| bad("unrecognised state"))?;
    let secs: u64 = ts.parse().map_err(|_| bad("timestamp is not unix seconds"))?;

    let mut obs = JobObservation::new(id, state, UNIX_EPOCH + Duration::from_secs(secs));
    if let Some(code) = fields.next() {
        let code: i32 = code.parse().map_err(|_| bad("exit code is not an integer"))?;
        obs = obs.with_exit(ExitInfo::with_code(code));
    }
    if fields.next().is_some() {
        return Err(bad("trailing fields"));
    }
    Ok(Some(obs))
}

fn parse_all(out: &str) -> Result<Vec<JobObservation>, PollerError> {
    let mut list = Vec::new();
    for line in out.lines() {
        if let Some(obs) = parse_line(line)? {
            list.push(obs);
        }
    }
    Ok(list)
}

#[async_trait]
impl BatchPoller for CommandPoller {
    async fn current_states(&self) -> Result<Vec<JobObservation>, PollerError> {
        let out = run(&self.list, &[]).await?;
        let list = parse_all(&out)?;
        debug!(jobs = list.len(), "scheduler listing parsed");
        Ok(list)
    }

    async fn final_state(
        &self,
        job_id: &JobId,
        since: SystemTime,
    ) -> Result<Option<JobObservation>, PollerError> {
        let history = self.history.as_ref().ok_or(PollerError::NoHistory)?;
        let since = since
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let out = run(history, &[job_id.to_string(), since]).await?;
        Ok(parse_all(&out)?
            .into_iter()
            .filter(|obs| &obs.job_id == job_id)
            .last())
    }
}
