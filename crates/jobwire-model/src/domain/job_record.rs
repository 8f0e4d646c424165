use std::{collections::BTreeMap, time::SystemTime};

use serde::{Deserialize, Serialize};

use super::{EndpointName, Revision, time_serde};
use crate::{ExitInfo, JobId, JobObservation, JobState};

/// Per-endpoint delivery bookkeeping stored with each record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    /// Newest revision the endpoint acknowledged.
    pub acked_revision: Revision,
    /// Failed delivery rounds since the last acknowledgement.
    pub failures: u32,
}

/// Registry entry for one job.
///
/// The registry is the single source of truth for both the job state and for
/// what each endpoint has already acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub state: JobState,
    /// When the current state was entered.
    #[serde(with = "time_serde")]
    pub last_update: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<ExitInfo>,
    /// Bumped by every transition applied by the updater; `0` for a freshly registered job.
    #[serde(default)]
    pub revision: Revision,
    /// Last time the scheduler listed this job.
    #[serde(default, with = "time_serde::option", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deliveries: BTreeMap<EndpointName, Delivery>,
}

/// Outcome of applying an observation to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record moved to a new state; `previous` is the state it left.
    Applied { previous: JobState },
    /// Same state as already recorded.
    Unchanged,
    /// The observation would break monotonicity and was ignored.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The record is terminal and therefore immutable.
    Terminal,
    /// `Unknown` never replaces a known state.
    Unknown,
    /// Non-terminal observation older than the recorded state.
    Stale,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Terminal => "record is terminal",
            RejectReason::Unknown => "unknown state does not replace a known one",
            RejectReason::Stale => "observation older than recorded state",
        }
    }
}

impl JobRecord {
    /// Record for a job registered by the submitter (revision 0, nothing to report yet).
    pub fn new(job_id: impl Into<JobId>, state: JobState, at: SystemTime) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            last_update: at,
            exit_info: None,
            revision: 0,
            last_seen: None,
            deliveries: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a scheduler observation, keeping transitions monotonic toward a terminal state.
    ///
    /// Terminal observations are accepted regardless of their timestamp; the
    /// scheduler's history is authoritative about how a job ended.
    pub fn apply(&mut self, obs: &JobObservation) -> Transition {
        if self.state.is_terminal() {
            return if obs.state == self.state {
                Transition::Unchanged
            } else {
                Transition::Rejected(RejectReason::Terminal)
            };
        }
        if !obs.state.is_known() && self.state.is_known() {
            return Transition::Rejected(RejectReason::Unknown);
        }
        if obs.state == self.state {
            return Transition::Unchanged;
        }
        if !obs.state.is_terminal() && obs.timestamp < self.last_update {
            return Transition::Rejected(RejectReason::Stale);
        }

        let previous = self.state;
        self.state = obs.state;
        self.last_update = obs.timestamp.max(self.last_update);
        if obs.exit_info.is_some() {
            self.exit_info = obs.exit_info.clone();
        }
        self.revision += 1;
        Transition::Applied { previous }
    }

    /// Delivery bookkeeping for `endpoint` (default when never contacted).
    pub fn delivery(&self, endpoint: &str) -> Delivery {
        self.deliveries.get(endpoint).copied().unwrap_or_default()
    }

    /// Whether `endpoint` still has to be told about the current revision.
    pub fn needs_report(&self, endpoint: &str) -> bool {
        self.revision > 0 && self.delivery(endpoint).acked_revision < self.revision
    }

    /// Record an acknowledgement. Returns `false` if it does not advance the endpoint.
    pub fn acknowledge(&mut self, endpoint: &str, revision: Revision) -> bool {
        let entry = self.deliveries.entry(endpoint.to_string()).or_default();
        if revision <= entry.acked_revision {
            return false;
        }
        entry.acked_revision = revision;
        entry.failures = 0;
        true
    }

    /// Count one failed delivery round toward `endpoint`.
    pub fn record_failure(&mut self, endpoint: &str) -> u32 {
        let entry = self.deliveries.entry(endpoint.to_string()).or_default();
        entry.failures = entry.failures.saturating_add(1);
        entry.failures
    }

    /// `endpoint` either acknowledged the current revision or exhausted `budget` attempts.
    pub fn settled_for(&self, endpoint: &str, budget: u32) -> bool {
        let d = self.delivery(endpoint);
        d.acked_revision >= self.revision || d.failures >= budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn obs(state: JobState, secs: u64) -> JobObservation {
        JobObservation::new("J1", state, at(secs))
    }

    #[test]
    fn forward_transitions_bump_revision() {
        let mut rec = JobRecord::new("J1", JobState::Idle, at(10));

        assert_eq!(
            rec.apply(&obs(JobState::Running, 20)),
            Transition::Applied {
                previous: JobState::Idle
            }
        );
        assert_eq!(rec.revision, 1);
        assert_eq!(rec.last_update, at(20));

        assert_eq!(
            rec.apply(&obs(JobState::Completed, 30)),
            Transition::Applied {
                previous: JobState::Running
            }
        );
        assert_eq!(rec.revision, 2);
        assert!(rec.is_terminal());
    }

    #[test]
    fn terminal_record_never_reverts() {
        let mut rec = JobRecord::new("J1", JobState::Running, at(10));
        rec.apply(&obs(JobState::Cancelled, 20));

        assert_eq!(
            rec.apply(&obs(JobState::Running, 99)),
            Transition::Rejected(RejectReason::Terminal)
        );
        assert_eq!(
            rec.apply(&obs(JobState::Completed, 99)),
            Transition::Rejected(RejectReason::Terminal)
        );
        assert_eq!(rec.apply(&obs(JobState::Cancelled, 99)), Transition::Unchanged);
        assert_eq!(rec.state, JobState::Cancelled);
        assert_eq!(rec.revision, 1);
    }

    #[test]
    fn stale_and_duplicate_observations_are_ignored() {
        let mut rec = JobRecord::new("J1", JobState::Idle, at(10));
        rec.apply(&obs(JobState::Held, 30));

        assert_eq!(
            rec.apply(&obs(JobState::Running, 20)),
            Transition::Rejected(RejectReason::Stale)
        );
        assert_eq!(rec.apply(&obs(JobState::Held, 40)), Transition::Unchanged);
        assert_eq!(rec.state, JobState::Held);
        assert_eq!(rec.revision, 1);
    }

    #[test]
    fn late_terminal_observation_still_wins() {
        let mut rec = JobRecord::new("J1", JobState::Running, at(50));
        let done = obs(JobState::Completed, 40).with_exit(ExitInfo::with_code(0));

        assert!(matches!(rec.apply(&done), Transition::Applied { .. }));
        assert_eq!(rec.last_update, at(50));
        assert_eq!(rec.exit_info, Some(ExitInfo::with_code(0)));
    }

    #[test]
    fn unknown_does_not_replace_known_state() {
        let mut rec = JobRecord::new("J1", JobState::Running, at(10));
        assert_eq!(
            rec.apply(&obs(JobState::Unknown, 20)),
            Transition::Rejected(RejectReason::Unknown)
        );
    }

    #[test]
    fn delivery_bookkeeping() {
        let mut rec = JobRecord::new("J1", JobState::Idle, at(10));
        assert!(!rec.needs_report("a"));

        rec.apply(&obs(JobState::Running, 20));
        assert!(rec.needs_report("a"));
        assert!(!rec.settled_for("a", 3));

        assert_eq!(rec.record_failure("a"), 1);
        assert!(rec.acknowledge("a", 1));
        assert!(!rec.acknowledge("a", 1));
        assert_eq!(rec.delivery("a").failures, 0);
        assert!(!rec.needs_report("a"));
        assert!(rec.needs_report("b"));

        rec.record_failure("b");
        rec.record_failure("b");
        assert!(rec.settled_for("b", 2));
    }

    #[test]
    fn serde_roundtrip_keeps_deliveries() {
        let mut rec = JobRecord::new("J1", JobState::Idle, at(10));
        rec.apply(&obs(JobState::Running, 20));
        rec.acknowledge("collector-a", 1);
        rec.last_seen = Some(at(25));

        let json = serde_json::to_string(&rec).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
