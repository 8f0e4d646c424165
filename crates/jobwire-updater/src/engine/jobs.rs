//! Registry side of the engine: polling, transitions, queue derivation,
//! purging and the periodic consistency check.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use jobwire_core::{PollerError, RegistryError};
use jobwire_model::{
    EventKind, JobId, JobObservation, JobRecord, JobState, JobUpdate, Transition, UpdaterEvent,
};
use jobwire_secure::{CredentialError, acquire_credential, credential_lifetime};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::Engine;
use crate::{endpoint::Enqueued, errors::UpdaterError};

/// Result of a poll run off the engine's critical path.
pub(crate) enum PollDone {
    Listing {
        started: SystemTime,
        result: Result<Vec<JobObservation>, PollerError>,
    },
    Finals(Vec<(JobId, Result<Option<JobObservation>, PollerError>)>),
}

fn update_for(record: &JobRecord, origin: &str) -> JobUpdate {
    JobUpdate {
        seq: 0,
        origin: origin.to_string(),
        job_id: record.job_id.clone(),
        revision: record.revision,
        state: record.state,
        timestamp: record.last_update,
        exit_info: record.exit_info.clone(),
    }
}

impl Engine {
    /// Run every due timer in a fixed order: query, final query, purge, consistency.
    pub(super) fn run_due_timers(&mut self, now: Instant) -> Result<(), UpdaterError> {
        if self.timers.query <= now && self.poll.is_none() {
            self.start_listing();
            self.timers.query = now + self.query_period();
        }
        if self.timers.final_query <= now && self.poll.is_none() {
            self.start_final_queries();
            self.timers.final_query = now + self.config.final_query_interval();
        }
        if self.timers.purge <= now {
            self.purge();
            self.timers.purge = now + self.config.purge_interval();
        }
        if self.timers.consistency <= now {
            self.consistency_check(now)?;
            self.timers.consistency = now + self.config.consistency_interval();
        }
        Ok(())
    }

    fn query_period(&self) -> std::time::Duration {
        if self.all_done {
            self.config.alldone_interval()
        } else {
            self.config.query_interval()
        }
    }

    fn start_listing(&mut self) {
        let poller = Arc::clone(&self.poller);
        let limit = self.config.poll_timeout();
        trace!("querying batch system");
        self.poll = Some(Box::pin(async move {
            let started = SystemTime::now();
            let result = match timeout(limit, poller.current_states()).await {
                Ok(result) => result,
                Err(_) => Err(PollerError::Timeout(limit)),
            };
            PollDone::Listing { started, result }
        }));
    }

    /// Look up how vanished jobs ended: non-terminal records missing from the last listing.
    fn start_final_queries(&mut self) {
        let Some(listed) = &self.last_listing else {
            return;
        };
        let records = match self.registry.scan() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "registry scan failed; final queries skipped");
                return;
            }
        };
        let missing: Vec<(JobId, SystemTime)> = records
            .into_iter()
            .filter(|r| !r.is_terminal() && !listed.contains(&r.job_id))
            .map(|r| (r.job_id, r.last_update))
            .collect();
        if missing.is_empty() {
            return;
        }

        debug!(jobs = missing.len(), "querying history for vanished jobs");
        let poller = Arc::clone(&self.poller);
        let limit = self.config.poll_timeout();
        self.poll = Some(Box::pin(async move {
            let mut out = Vec::with_capacity(missing.len());
            for (job_id, since) in missing {
                let result = match timeout(limit, poller.final_state(&job_id, since)).await {
                    Ok(result) => result,
                    Err(_) => Err(PollerError::Timeout(limit)),
                };
                out.push((job_id, result));
            }
            PollDone::Finals(out)
        }));
    }

    pub(super) fn on_poll_done(&mut self, done: PollDone) {
        match done {
            PollDone::Listing {
                started,
                result: Ok(observations),
            } => {
                let listed: HashSet<JobId> =
                    observations.iter().map(|o| o.job_id.clone()).collect();
                for obs in &observations {
                    self.apply_observation(obs, started);
                }
                self.last_listing = Some(listed);
                self.refresh_all_done();
            }
            PollDone::Listing { result: Err(e), .. } => {
                warn!(error = %e, "batch system query failed");
                self.events
                    .emit(UpdaterEvent::new(EventKind::PollFailed).with_reason(e.to_string()));
            }
            PollDone::Finals(results) => {
                let seen = SystemTime::now();
                for (job_id, result) in results {
                    match result {
                        Ok(Some(obs)) => self.apply_observation(&obs, seen),
                        Ok(None) => debug!(job = %job_id, "no history entry yet"),
                        Err(e) => {
                            warn!(job = %job_id, error = %e, "history query failed");
                            self.events.emit(
                                UpdaterEvent::new(EventKind::PollFailed)
                                    .with_job(&job_id)
                                    .with_reason(e.to_string()),
                            );
                        }
                    }
                }
                self.refresh_all_done();
            }
        }
    }

    /// Apply one scheduler observation to its registry record. Unregistered jobs are ignored.
    pub(super) fn apply_observation(&mut self, obs: &JobObservation, seen: SystemTime) {
        let record = match self.registry.get(&obs.job_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                trace!(job = %obs.job_id, "job not registered; ignored");
                return;
            }
            Err(e) => {
                warn!(job = %obs.job_id, error = %e, "registry read failed");
                return;
            }
        };
        if let Err(e) = self.transition(record, obs, seen) {
            error!(job = %obs.job_id, error = %e, "registry write failed; transition dropped");
        }
    }

    /// Apply an update relayed by a peer updater. Jobs this updater has never
    /// seen are registered on the spot.
    pub(super) fn apply_inbound(
        &mut self,
        update: &JobUpdate,
        peer: &str,
    ) -> Result<Transition, RegistryError> {
        let record = match self.registry.get(&update.job_id)? {
            Some(record) => record,
            None => {
                debug!(job = %update.job_id, %peer, "registering job reported by a peer updater");
                JobRecord::new(update.job_id.clone(), JobState::Unknown, UNIX_EPOCH)
            }
        };
        let obs = JobObservation {
            job_id: update.job_id.clone(),
            state: update.state,
            timestamp: update.timestamp,
            exit_info: update.exit_info.clone(),
        };
        self.transition(record, &obs, SystemTime::now())
    }

    /// Apply `obs` to `record`; an applied transition is stored and queued for every collector.
    fn transition(
        &mut self,
        mut record: JobRecord,
        obs: &JobObservation,
        seen: SystemTime,
    ) -> Result<Transition, RegistryError> {
        let outcome = record.apply(obs);
        match outcome {
            Transition::Applied { previous } => {
                record.last_seen = Some(seen);
                let update = update_for(&record, &self.origin);
                self.registry.put(record)?;
                info!(
                    job = %update.job_id,
                    from = %previous,
                    to = %update.state,
                    revision = update.revision,
                    "job transition"
                );
                self.events.emit(
                    UpdaterEvent::new(EventKind::JobTransition)
                        .with_job(&update.job_id)
                        .with_state(update.state),
                );
                self.enqueue_everywhere(&update);
            }
            Transition::Unchanged => {}
            Transition::Rejected(reason) => {
                debug!(job = %obs.job_id, observed = %obs.state, reason = reason.as_str(), "transition rejected");
                self.events.emit(
                    UpdaterEvent::new(EventKind::TransitionRejected)
                        .with_job(&obs.job_id)
                        .with_state(obs.state)
                        .with_reason(reason.as_str()),
                );
            }
        }
        Ok(outcome)
    }

    fn enqueue_everywhere(&mut self, update: &JobUpdate) {
        let max_depth = self.config.max_queue_depth;
        for ep in self.endpoints.iter_mut().filter(|ep| !ep.is_acceptor()) {
            let outcome = ep.enqueue(update.clone(), max_depth);
            let event = |kind| {
                UpdaterEvent::new(kind)
                    .with_endpoint(ep.name())
                    .with_job(&update.job_id)
                    .with_state(update.state)
                    .with_queue_depth(ep.queue_depth())
            };
            match outcome {
                Enqueued::Queued => self.events.emit(event(EventKind::UpdateQueued)),
                Enqueued::Duplicate => {}
                Enqueued::Coalesced(dropped) => {
                    debug!(endpoint = ep.name(), dropped = %dropped, "queue full; superseded update coalesced");
                    self.events.emit(event(EventKind::UpdateCoalesced).with_reason(dropped.to_string()));
                }
                Enqueued::Overflow => {
                    warn!(
                        endpoint = ep.name(),
                        depth = ep.queue_depth(),
                        "queue above its depth limit with nothing to coalesce"
                    );
                    self.events.emit(event(EventKind::UpdateQueued));
                }
            }
        }
    }

    /// Queue the current revision of every record an endpoint has not acknowledged
    /// and does not already hold.
    pub(super) fn derive_queues(&mut self) -> Result<(), UpdaterError> {
        let records = self.registry.scan()?;
        let max_depth = self.config.max_queue_depth;
        let mut derived = 0usize;
        for record in records.iter().filter(|r| r.revision > 0) {
            let update = update_for(record, &self.origin);
            for ep in self.endpoints.iter_mut().filter(|ep| !ep.is_acceptor()) {
                if record.needs_report(ep.name()) && !ep.is_pending(&record.job_id, record.revision)
                {
                    ep.enqueue(update.clone(), max_depth);
                    derived += 1;
                }
            }
        }
        if derived > 0 {
            debug!(updates = derived, "queued unacknowledged updates from the registry");
        }
        Ok(())
    }

    pub(super) fn record_ack(&mut self, endpoint: &str, job_id: &JobId, revision: u64) {
        let mut record = match self.registry.get(job_id) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(job = %job_id, error = %e, "registry read failed; acknowledgement not recorded");
                return;
            }
        };
        if record.acknowledge(endpoint, revision) {
            if let Err(e) = self.registry.put(record) {
                warn!(job = %job_id, error = %e, "registry write failed; acknowledgement not recorded");
            }
        }
    }

    pub(super) fn record_delivery_failures(&mut self, endpoint: &str, jobs: &[JobId]) {
        for job_id in jobs {
            let Ok(Some(mut record)) = self.registry.get(job_id) else {
                continue;
            };
            let failures = record.record_failure(endpoint);
            trace!(endpoint, job = %job_id, failures, "delivery failure counted");
            if let Err(e) = self.registry.put(record) {
                warn!(job = %job_id, error = %e, "registry write failed");
            }
        }
    }

    fn refresh_all_done(&mut self) {
        let active = match self.registry.scan() {
            Ok(records) => records.iter().filter(|r| !r.is_terminal()).count(),
            Err(e) => {
                warn!(error = %e, "registry scan failed");
                return;
            }
        };
        let all_done = active == 0;
        if all_done && !self.all_done {
            debug!("no active jobs; slowing state queries");
            self.timers.query = Instant::now() + self.config.alldone_interval();
        }
        self.all_done = all_done;
    }

    /// Delete terminal records older than the purge interval that every endpoint
    /// has acknowledged or given up on.
    pub(super) fn purge(&mut self) {
        let records = match self.registry.scan() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "registry scan failed; purge skipped");
                return;
            }
        };
        let now = SystemTime::now();
        let min_age = self.config.purge_interval();
        let budget = self.config.max_delivery_attempts;

        let mut purged = 0usize;
        for record in records {
            if !record.is_terminal() {
                continue;
            }
            let age = now.duration_since(record.last_update).unwrap_or_default();
            if age < min_age {
                continue;
            }
            let settled = self
                .endpoints
                .iter()
                .filter(|ep| !ep.is_acceptor())
                .all(|ep| !ep.is_unacked(&record.job_id) && record.settled_for(ep.name(), budget));
            if !settled {
                continue;
            }

            match self.registry.delete(&record.job_id) {
                Ok(true) => {
                    for ep in &mut self.endpoints {
                        ep.discard(&record.job_id);
                    }
                    debug!(job = %record.job_id, state = %record.state, "record purged");
                    self.events.emit(
                        UpdaterEvent::new(EventKind::JobPurged)
                            .with_job(&record.job_id)
                            .with_state(record.state),
                    );
                    purged += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(job = %record.job_id, error = %e, "registry delete failed"),
            }
        }
        if purged > 0 {
            info!(purged, "purged finished jobs");
        }
    }

    /// Revive stale endpoints, refresh the credential and re-derive queues.
    pub(super) fn consistency_check(&mut self, now: Instant) -> Result<(), UpdaterError> {
        for ep in &mut self.endpoints {
            if ep.on_consistency_tick() {
                info!(endpoint = ep.name(), "stale endpoint gets another attempt");
                self.events.emit(
                    UpdaterEvent::new(EventKind::EndpointRevived)
                        .with_endpoint(ep.name())
                        .with_queue_depth(ep.queue_depth()),
                );
            }
        }

        self.check_credential()?;

        if let Err(e) = self.derive_queues() {
            warn!(error = %e, "re-deriving queues failed");
        }

        if self.all_done {
            let active = self
                .registry
                .scan()
                .map(|records| records.iter().any(|r| !r.is_terminal()))
                .unwrap_or(false);
            if active {
                debug!("active jobs registered; resuming regular state queries");
                self.all_done = false;
                self.timers.query = now;
            }
        }
        Ok(())
    }

    /// Refresh the credential when it is close to expiry. Fails once it has
    /// expired and no usable replacement exists.
    pub(super) fn check_credential(&mut self) -> Result<(), UpdaterError> {
        let remaining = credential_lifetime(&self.credential)?;
        if remaining > self.config.consistency_interval() {
            return Ok(());
        }

        if let Some(path) = &self.credential_path {
            match acquire_credential(self.credential.usage(), Some(path)) {
                Ok(fresh) => {
                    let lifetime = credential_lifetime(&fresh)?;
                    if lifetime > remaining {
                        info!(
                            principal = fresh.principal(),
                            lifetime_secs = lifetime.as_secs(),
                            "credential refreshed"
                        );
                        self.credential = fresh;
                        self.events.emit(
                            UpdaterEvent::new(EventKind::CredentialRefreshed)
                                .with_reason(self.credential.principal()),
                        );
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "credential refresh failed"),
            }
        }

        if remaining.is_zero() {
            error!(principal = self.credential.principal(), "credential expired");
            return Err(CredentialError::Expired {
                principal: self.credential.principal().to_string(),
            }
            .into());
        }
        warn!(
            principal = self.credential.principal(),
            remaining_secs = remaining.as_secs(),
            "credential expires soon"
        );
        Ok(())
    }
}
