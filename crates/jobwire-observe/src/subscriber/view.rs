use std::borrow::Borrow;

use jobwire_model::{EventKind, UpdaterEvent};
use tracing::{debug, info, trace, warn};

/// Field accessors with log-friendly fallbacks.
pub trait View {
    fn kind(&self) -> EventKind;
    fn as_endpoint(&self) -> &str;
    fn as_job(&self) -> &str;
    fn as_state(&self) -> &str;
    fn as_reason(&self) -> &str;
    fn attempt(&self) -> u32;
    fn queue_depth(&self) -> usize;
}

impl<T> View for T
where
    T: Borrow<UpdaterEvent>,
{
    #[inline]
    fn kind(&self) -> EventKind {
        self.borrow().kind
    }
    #[inline]
    fn as_endpoint(&self) -> &str {
        self.borrow().endpoint.as_deref().unwrap_or("-")
    }
    #[inline]
    fn as_job(&self) -> &str {
        self.borrow().job.as_ref().map_or("-", |j| j.as_str())
    }
    #[inline]
    fn as_state(&self) -> &str {
        self.borrow().state.map_or("-", |s| s.as_str())
    }
    #[inline]
    fn as_reason(&self) -> &str {
        self.borrow().reason.as_deref().unwrap_or("unknown")
    }
    #[inline]
    fn attempt(&self) -> u32 {
        self.borrow().attempt.unwrap_or(0)
    }
    #[inline]
    fn queue_depth(&self) -> usize {
        self.borrow().queue_depth.unwrap_or(0)
    }
}

#[inline]
pub fn message_for(kind: EventKind) -> &'static str {
    match kind {
        // endpoint
        EventKind::EndpointConnecting => "connecting to collector",
        EventKind::EndpointListening => "listening for peer updaters",
        EventKind::EndpointReady => "collector authenticated; ready to send",
        EventKind::EndpointFailed => "collector link failed; reconnect scheduled",
        EventKind::EndpointClosed => "collector closed the connection",
        EventKind::EndpointStale => "collector marked stale until the next consistency check",
        EventKind::EndpointRevived => "stale collector gets another attempt",

        // delivery
        EventKind::UpdateQueued => "update queued",
        EventKind::UpdateCoalesced => "superseded update dropped from a full queue",
        EventKind::UpdateSent => "update sent",
        EventKind::UpdateAcked => "update acknowledged",
        EventKind::UpdateReceived => "update received from a peer updater",

        // registry
        EventKind::JobTransition => "job changed state",
        EventKind::TransitionRejected => "observation rejected",
        EventKind::JobPurged => "finished job purged from the registry",

        // engine
        EventKind::PollFailed => "batch system query failed",
        EventKind::CredentialRefreshed => "credential refreshed",
        EventKind::Reconfigured => "endpoints reconfigured",
    }
}

#[inline]
pub fn log_event<E: View>(e: E) {
    let msg = message_for(e.kind());

    match e.kind() {
        // endpoint
        EventKind::EndpointConnecting => {
            debug!(endpoint = e.as_endpoint(), queue_depth = e.queue_depth(), "{msg}")
        }
        EventKind::EndpointListening => {
            info!(endpoint = e.as_endpoint(), address = e.as_reason(), "{msg}")
        }
        EventKind::EndpointReady => {
            info!(endpoint = e.as_endpoint(), peer = e.as_reason(), "{msg}")
        }
        EventKind::EndpointFailed => warn!(
            endpoint = e.as_endpoint(),
            attempt = e.attempt(),
            queue_depth = e.queue_depth(),
            reason = e.as_reason(),
            "{msg}"
        ),
        EventKind::EndpointClosed => {
            debug!(endpoint = e.as_endpoint(), attempt = e.attempt(), "{msg}")
        }
        EventKind::EndpointStale => {
            warn!(endpoint = e.as_endpoint(), attempt = e.attempt(), "{msg}")
        }
        EventKind::EndpointRevived => info!(endpoint = e.as_endpoint(), "{msg}"),

        // delivery
        EventKind::UpdateQueued => trace!(
            endpoint = e.as_endpoint(),
            job = e.as_job(),
            state = e.as_state(),
            queue_depth = e.queue_depth(),
            "{msg}"
        ),
        EventKind::UpdateCoalesced => debug!(
            endpoint = e.as_endpoint(),
            job = e.as_job(),
            dropped = e.as_reason(),
            "{msg}"
        ),
        EventKind::UpdateSent => {
            trace!(endpoint = e.as_endpoint(), job = e.as_job(), state = e.as_state(), "{msg}")
        }
        EventKind::UpdateAcked => {
            debug!(endpoint = e.as_endpoint(), job = e.as_job(), state = e.as_state(), "{msg}")
        }
        EventKind::UpdateReceived => debug!(
            endpoint = e.as_endpoint(),
            job = e.as_job(),
            state = e.as_state(),
            peer = e.as_reason(),
            "{msg}"
        ),

        // registry
        EventKind::JobTransition => info!(job = e.as_job(), state = e.as_state(), "{msg}"),
        EventKind::TransitionRejected => {
            debug!(job = e.as_job(), state = e.as_state(), reason = e.as_reason(), "{msg}")
        }
        EventKind::JobPurged => debug!(job = e.as_job(), state = e.as_state(), "{msg}"),

        // engine
        EventKind::PollFailed => warn!(job = e.as_job(), reason = e.as_reason(), "{msg}"),
        EventKind::CredentialRefreshed => info!(principal = e.as_reason(), "{msg}"),
        EventKind::Reconfigured => info!(reason = e.as_reason(), "{msg}"),
    }
}

#[cfg(test)]
mod tests {
    use jobwire_model::{JobId, JobState};

    use super::*;

    #[test]
    fn missing_fields_fall_back() {
        let ev = UpdaterEvent::new(EventKind::PollFailed);
        assert_eq!(ev.as_endpoint(), "-");
        assert_eq!(ev.as_job(), "-");
        assert_eq!(ev.as_reason(), "unknown");
        assert_eq!(ev.attempt(), 0);
    }

    #[test]
    fn present_fields_are_exposed() {
        let ev = UpdaterEvent::new(EventKind::UpdateAcked)
            .with_endpoint("central")
            .with_job(&JobId::from("J1"))
            .with_state(JobState::Completed);
        assert_eq!(ev.as_endpoint(), "central");
        assert_eq!(ev.as_job(), "J1");
        assert_eq!(ev.as_state(), JobState::Completed.as_str());
        log_event(&ev);
    }
}
