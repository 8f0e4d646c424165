//! One remote collector: link state machine plus its ordered send queue.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> AUTHENTICATING -> READY <-> SENDING
//!       ^             |               |             |          |
//!       +-------------+---------------+-------------+----------+  (any failure)
//! ```
//!
//! Updates move `queue -> in_flight -> unacked` and leave on a cumulative
//! acknowledgement. On failure everything not yet acknowledged is put back at
//! the head of the queue in its original order.
//!
//! An acceptor endpoint instead binds its address and serves one peer updater
//! at a time: `LISTENING -> AUTHENTICATING -> READY -> LISTENING`. Losing an
//! inbound connection does not count against the endpoint; losing the
//! listener does.

mod link;
pub(crate) use link::{LinkCtx, Wake};

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    time::{Instant, SystemTime},
};

use jobwire_core::{EndpointConfig, EndpointRole, UpdaterConfig};
use jobwire_model::{JobId, JobState, JobUpdate};
use link::Link;
use tokio::net::TcpListener;

/// Updates written but not yet acknowledged before the endpoint stops sending.
pub const SEND_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Listening,
    Authenticating,
    Ready,
    Sending,
}

impl EndpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Disconnected => "disconnected",
            EndpointState::Connecting => "connecting",
            EndpointState::Listening => "listening",
            EndpointState::Authenticating => "authenticating",
            EndpointState::Ready => "ready",
            EndpointState::Sending => "sending",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub name: String,
    pub address: String,
    pub role: EndpointRole,
    /// Bound address of a listening acceptor.
    pub listening: Option<SocketAddr>,
    pub state: EndpointState,
    /// Updates not yet written.
    pub queue_depth: usize,
    /// Updates written and awaiting acknowledgement.
    pub unacked: usize,
    pub consecutive_failures: u32,
    pub stale: bool,
    pub last_success: Option<SystemTime>,
    pub last_error: Option<String>,
}

/// Update written on the current connection.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub seq: u64,
    pub update: JobUpdate,
}

/// Something the engine must account for after driving an endpoint.
#[derive(Debug)]
pub(crate) enum Progress {
    Established { peer: String },
    Listening { address: SocketAddr },
    /// Update delivered by a peer updater; the engine acknowledges it once applied.
    Received { update: JobUpdate, peer: String },
    Sent { job_id: JobId, state: JobState, seq: u64 },
    Acked(Vec<JobUpdate>),
    Failed(Failure),
}

/// Why a link was torn down.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub reason: String,
    /// Peer hung up at a frame boundary.
    pub clean: bool,
    /// Local credential could not be used.
    pub credential: bool,
    /// This failure made the endpoint stale.
    pub went_stale: bool,
}

impl Failure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            clean: false,
            credential: false,
            went_stale: false,
        }
    }
}

/// Result of [`Endpoint::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// The same or a newer revision is already pending.
    Duplicate,
    /// Queued; an older entry for the named job was dropped to respect the depth limit.
    Coalesced(JobId),
    /// Queued beyond the depth limit; no entry could be coalesced.
    Overflow,
}

pub(crate) struct Endpoint {
    config: EndpointConfig,
    link: Link,
    listener: Option<TcpListener>,
    listening: Option<SocketAddr>,
    queue: VecDeque<JobUpdate>,
    in_flight: Option<Outbound>,
    unacked: VecDeque<Outbound>,
    next_seq: u64,
    last_success: Option<SystemTime>,
    consecutive_failures: u32,
    /// Failures with no success in between, since the last consistency tick.
    window_failures: u32,
    stale: bool,
    /// Revived from stale: the next failure without a success makes it stale again.
    last_chance: bool,
    /// Earliest next connect attempt; `None` means immediately.
    retry_at: Option<Instant>,
    last_error: Option<String>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            link: Link::Idle,
            listener: None,
            listening: None,
            queue: VecDeque::new(),
            in_flight: None,
            unacked: VecDeque::new(),
            next_seq: 1,
            last_success: None,
            consecutive_failures: 0,
            window_failures: 0,
            stale: false,
            last_chance: false,
            retry_at: None,
            last_error: None,
        }
    }

    /// Fresh endpoint for `config` carrying over `pending` updates in order.
    pub fn with_pending(config: EndpointConfig, pending: VecDeque<JobUpdate>) -> Self {
        let mut ep = Self::new(config);
        ep.queue = pending;
        ep
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn is_acceptor(&self) -> bool {
        self.config.is_acceptor()
    }

    pub fn state(&self) -> EndpointState {
        match &self.link {
            Link::Idle if self.listener.is_some() => EndpointState::Listening,
            Link::Idle => EndpointState::Disconnected,
            Link::Connecting { .. } => EndpointState::Connecting,
            Link::Handshaking { .. } => EndpointState::Authenticating,
            Link::Established { .. } if self.in_flight.is_some() => EndpointState::Sending,
            Link::Established { .. } => EndpointState::Ready,
        }
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            role: self.config.role,
            listening: self.listening,
            state: self.state(),
            queue_depth: self.queue.len(),
            unacked: self.unacked.len() + usize::from(self.in_flight.is_some()),
            consecutive_failures: self.consecutive_failures,
            stale: self.stale,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.in_flight.is_some() || !self.unacked.is_empty()
    }

    fn pending(&self) -> impl Iterator<Item = &JobUpdate> {
        self.unacked
            .iter()
            .map(|o| &o.update)
            .chain(self.in_flight.iter().map(|o| &o.update))
            .chain(self.queue.iter())
    }

    /// Whether `revision` (or a newer one) of `job_id` is queued or awaiting acknowledgement.
    pub fn is_pending(&self, job_id: &JobId, revision: u64) -> bool {
        self.pending()
            .any(|u| &u.job_id == job_id && u.revision >= revision)
    }

    /// Whether an update for `job_id` has been written and not yet acknowledged.
    pub fn is_unacked(&self, job_id: &JobId) -> bool {
        self.in_flight
            .iter()
            .chain(self.unacked.iter())
            .any(|o| &o.update.job_id == job_id)
    }

    /// Terminal jobs this endpoint still owes a delivery for.
    pub fn pending_terminal_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .pending()
            .filter(|u| u.state.is_terminal())
            .map(|u| u.job_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Append `update`, coalescing the oldest superseded non-terminal entry when
    /// the queue grows past `max_depth`.
    pub fn enqueue(&mut self, update: JobUpdate, max_depth: usize) -> Enqueued {
        if self.is_pending(&update.job_id, update.revision) {
            return Enqueued::Duplicate;
        }
        self.queue.push_back(update);
        if self.queue.len() <= max_depth {
            return Enqueued::Queued;
        }

        let victim = (0..self.queue.len()).find(|&i| {
            let entry = &self.queue[i];
            !entry.state.is_terminal()
                && self
                    .queue
                    .iter()
                    .skip(i + 1)
                    .any(|later| later.job_id == entry.job_id)
        });
        match victim.and_then(|i| self.queue.remove(i)) {
            Some(dropped) => Enqueued::Coalesced(dropped.job_id),
            None => Enqueued::Overflow,
        }
    }

    /// Drop queued (never written) updates for `job_id`.
    pub fn discard(&mut self, job_id: &JobId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|u| &u.job_id != job_id);
        before - self.queue.len()
    }

    /// Close the link and hand back everything not yet acknowledged, oldest first.
    pub fn into_pending(mut self) -> VecDeque<JobUpdate> {
        self.restore_pending();
        self.queue
    }

    fn restore_pending(&mut self) {
        let mut restored: VecDeque<JobUpdate> = self.unacked.drain(..).map(|o| o.update).collect();
        restored.extend(self.in_flight.take().map(|o| o.update));
        restored.append(&mut self.queue);
        self.queue = restored;
    }

    /// Initiators need a link while they have something to deliver; acceptors
    /// need their listener.
    fn wants_link(&self) -> bool {
        if self.is_acceptor() {
            self.listener.is_none()
        } else {
            self.has_work()
        }
    }

    /// Idle, not stale, needs a link and its backoff has elapsed.
    pub fn should_connect(&self, now: Instant) -> bool {
        matches!(self.link, Link::Idle)
            && !self.stale
            && self.wants_link()
            && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Nearest instant at which this endpoint needs attention without I/O.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.link {
            Link::Idle if !self.stale && self.wants_link() => self.retry_at,
            Link::Idle => None,
            Link::Connecting { deadline, .. } | Link::Handshaking { deadline, .. } => {
                Some(*deadline)
            }
            Link::Established { .. } => None,
        }
    }

    /// Consistency tick: reset the failure window; a stale endpoint gets one more attempt.
    /// Returns `true` if the endpoint was revived.
    pub fn on_consistency_tick(&mut self) -> bool {
        self.window_failures = 0;
        if !self.stale {
            return false;
        }
        self.stale = false;
        self.last_chance = true;
        self.retry_at = None;
        true
    }

    fn on_established(&mut self) {
        self.consecutive_failures = 0;
        self.window_failures = 0;
        self.last_chance = false;
        self.last_success = Some(SystemTime::now());
        self.last_error = None;
    }

    fn fail(&mut self, mut failure: Failure, config: &UpdaterConfig) -> Failure {
        self.link = Link::Idle;
        self.listener = None;
        self.listening = None;
        self.restore_pending();

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.window_failures = self.window_failures.saturating_add(1);
        if self.last_chance || self.window_failures > config.max_consecutive_failures {
            self.stale = true;
            self.last_chance = false;
            self.retry_at = None;
            failure.went_stale = true;
        } else {
            self.retry_at =
                Some(Instant::now() + config.backoff.delay(self.consecutive_failures));
        }
        self.last_error = Some(failure.reason.clone());
        failure
    }

    fn can_send(&self) -> bool {
        self.in_flight.is_none() && !self.queue.is_empty() && self.unacked.len() < SEND_WINDOW
    }

    /// Release everything acknowledged by a cumulative ack for `seq`.
    fn ack_through(&mut self, seq: u64, acked: &mut Vec<JobUpdate>) {
        while self.unacked.front().is_some_and(|o| o.seq <= seq) {
            if let Some(o) = self.unacked.pop_front() {
                acked.push(o.update);
            }
        }
        if self.in_flight.as_ref().is_some_and(|o| o.seq <= seq) {
            if let Some(o) = self.in_flight.take() {
                acked.push(o.update);
            }
        }
    }
}

#[cfg(test)]
impl Endpoint {
    /// Record `update` as written and awaiting acknowledgement.
    pub(crate) fn mark_written(&mut self, update: JobUpdate) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.unacked.push_back(Outbound { seq, update });
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn update(job: &str, revision: u64, state: JobState) -> JobUpdate {
        JobUpdate {
            seq: 0,
            origin: "ce01".into(),
            job_id: JobId::from(job),
            revision,
            state,
            timestamp: UNIX_EPOCH + Duration::from_secs(revision),
            exit_info: None,
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(EndpointConfig::new("central", "127.0.0.1:1"))
    }

    fn order(ep: &Endpoint) -> Vec<(String, u64)> {
        ep.pending()
            .map(|u| (u.job_id.to_string(), u.revision))
            .collect()
    }

    #[test]
    fn duplicate_revisions_are_not_queued_twice() {
        let mut ep = endpoint();
        assert_eq!(ep.enqueue(update("J1", 1, JobState::Running), 8), Enqueued::Queued);
        assert_eq!(ep.enqueue(update("J1", 1, JobState::Running), 8), Enqueued::Duplicate);
        assert_eq!(ep.queue_depth(), 1);
    }

    #[test]
    fn coalescing_drops_oldest_superseded_non_terminal() {
        let mut ep = endpoint();
        ep.enqueue(update("J1", 1, JobState::Running), 3);
        ep.enqueue(update("J2", 1, JobState::Running), 3);
        ep.enqueue(update("J2", 2, JobState::Held), 3);
        let res = ep.enqueue(update("J1", 2, JobState::Completed), 3);

        assert_eq!(res, Enqueued::Coalesced(JobId::from("J1")));
        assert_eq!(
            order(&ep),
            vec![("J2".into(), 1), ("J2".into(), 2), ("J1".into(), 2)]
        );
    }

    #[test]
    fn terminal_entries_are_never_coalesced() {
        let mut ep = endpoint();
        ep.enqueue(update("J1", 1, JobState::Completed), 1);
        assert_eq!(ep.enqueue(update("J2", 1, JobState::Failed), 1), Enqueued::Overflow);
        assert_eq!(ep.queue_depth(), 2);
    }

    #[test]
    fn failure_restores_unacked_then_in_flight_then_queue() {
        let mut ep = endpoint();
        ep.unacked.push_back(Outbound {
            seq: 1,
            update: update("J1", 1, JobState::Running),
        });
        ep.in_flight = Some(Outbound {
            seq: 2,
            update: update("J2", 1, JobState::Running),
        });
        ep.queue.push_back(update("J3", 1, JobState::Running));

        let cfg = UpdaterConfig::default();
        ep.fail(Failure::new("reset"), &cfg);

        assert_eq!(ep.state(), EndpointState::Disconnected);
        assert_eq!(
            order(&ep),
            vec![("J1".into(), 1), ("J2".into(), 1), ("J3".into(), 1)]
        );
        assert_eq!(ep.queue_depth(), 3);
        assert_eq!(ep.status().consecutive_failures, 1);
        assert!(!ep.should_connect(Instant::now()));
    }

    #[test]
    fn stale_after_window_and_single_retry_after_tick() {
        let mut ep = endpoint();
        ep.queue.push_back(update("J1", 1, JobState::Running));
        let cfg = UpdaterConfig {
            max_consecutive_failures: 2,
            ..UpdaterConfig::default()
        };

        assert!(!ep.fail(Failure::new("1"), &cfg).went_stale);
        assert!(!ep.fail(Failure::new("2"), &cfg).went_stale);
        assert!(ep.fail(Failure::new("3"), &cfg).went_stale);
        assert!(ep.is_stale());
        assert!(ep.deadline().is_none());
        assert!(!ep.should_connect(Instant::now() + Duration::from_secs(3600)));

        assert!(ep.on_consistency_tick());
        assert!(ep.should_connect(Instant::now()));
        assert!(ep.fail(Failure::new("4"), &cfg).went_stale);
    }

    #[test]
    fn successes_between_failures_keep_endpoint_fresh() {
        let mut ep = endpoint();
        ep.queue.push_back(update("J1", 1, JobState::Running));
        let cfg = UpdaterConfig {
            max_consecutive_failures: 2,
            ..UpdaterConfig::default()
        };

        for round in 0..5 {
            ep.on_established();
            let failure = ep.fail(Failure::new(format!("drop {round}")), &cfg);
            assert!(!failure.went_stale, "round {round}");
            assert_eq!(ep.status().consecutive_failures, 1);
        }
        assert!(!ep.is_stale());

        for n in 2..=3 {
            ep.fail(Failure::new(format!("refused {n}")), &cfg);
        }
        assert!(ep.is_stale());

        assert!(ep.on_consistency_tick());
        ep.on_established();
        assert!(!ep.fail(Failure::new("idle close"), &cfg).went_stale);
        assert!(!ep.is_stale());
    }

    #[test]
    fn tick_without_staleness_resets_the_window() {
        let mut ep = endpoint();
        let cfg = UpdaterConfig {
            max_consecutive_failures: 2,
            ..UpdaterConfig::default()
        };
        ep.fail(Failure::new("1"), &cfg);
        ep.fail(Failure::new("2"), &cfg);
        assert!(!ep.on_consistency_tick());
        assert!(!ep.fail(Failure::new("3"), &cfg).went_stale);
    }

    #[test]
    fn cumulative_ack_releases_prefix() {
        let mut ep = endpoint();
        for (seq, job) in [(1, "J1"), (2, "J2"), (3, "J3")] {
            ep.unacked.push_back(Outbound {
                seq,
                update: update(job, 1, JobState::Running),
            });
        }
        let mut acked = Vec::new();
        ep.ack_through(2, &mut acked);
        assert_eq!(acked.len(), 2);
        assert!(ep.is_unacked(&JobId::from("J3")));
        assert!(!ep.is_unacked(&JobId::from("J1")));
    }
}
