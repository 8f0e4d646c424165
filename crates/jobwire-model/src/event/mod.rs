use crate::{JobId, JobState};

/// Kind of updater lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // endpoint
    EndpointConnecting,
    EndpointListening,
    EndpointReady,
    EndpointFailed,
    EndpointClosed,
    EndpointStale,
    EndpointRevived,

    // delivery
    UpdateQueued,
    UpdateCoalesced,
    UpdateSent,
    UpdateAcked,
    UpdateReceived,

    // registry
    JobTransition,
    TransitionRejected,
    JobPurged,

    // engine
    PollFailed,
    CredentialRefreshed,
    Reconfigured,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EndpointConnecting => "endpoint_connecting",
            EventKind::EndpointListening => "endpoint_listening",
            EventKind::EndpointReady => "endpoint_ready",
            EventKind::EndpointFailed => "endpoint_failed",
            EventKind::EndpointClosed => "endpoint_closed",
            EventKind::EndpointStale => "endpoint_stale",
            EventKind::EndpointRevived => "endpoint_revived",
            EventKind::UpdateQueued => "update_queued",
            EventKind::UpdateCoalesced => "update_coalesced",
            EventKind::UpdateSent => "update_sent",
            EventKind::UpdateAcked => "update_acked",
            EventKind::UpdateReceived => "update_received",
            EventKind::JobTransition => "job_transition",
            EventKind::TransitionRejected => "transition_rejected",
            EventKind::JobPurged => "job_purged",
            EventKind::PollFailed => "poll_failed",
            EventKind::CredentialRefreshed => "credential_refreshed",
            EventKind::Reconfigured => "reconfigured",
        }
    }
}

/// Event published by the updater engine to its subscribers.
///
/// Optional fields are filled when relevant to the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterEvent {
    pub kind: EventKind,
    pub endpoint: Option<String>,
    pub job: Option<JobId>,
    pub state: Option<JobState>,
    pub reason: Option<String>,
    pub attempt: Option<u32>,
    pub queue_depth: Option<usize>,
}

impl UpdaterEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            endpoint: None,
            job: None,
            state: None,
            reason: None,
            attempt: None,
            queue_depth: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_job(mut self, job: &JobId) -> Self {
        self.job = Some(job.clone());
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }
}
