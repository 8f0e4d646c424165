//! The updater engine: one task that polls the batch system, keeps the job
//! registry current and feeds every configured collector.
//!
//! All endpoint I/O is multiplexed on readiness inside [`Engine::run`]; no
//! endpoint ever blocks the others, the poller or the timers.

mod jobs;
mod timers;

use std::{
    collections::HashSet,
    future::pending,
    mem,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use futures::future::{BoxFuture, select_all};
use jobwire_core::{
    BatchPoller, EndpointConfig, EventBus, JobRegistry, Subscribe, UpdaterConfig,
    validate_endpoints,
};
use jobwire_model::{EventKind, JobId, UpdaterEvent};
use jobwire_secure::{Credential, CredentialError, Mechanism, NoiseMechanism, Role};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::{Endpoint, EndpointStatus, LinkCtx, Progress, Wake},
    errors::UpdaterError,
    handle::{Control, EngineHandle},
};
use jobs::PollDone;
use timers::Timers;

const CONTROL_CAPACITY: usize = 16;

/// Publishes events to subscribers once the engine is running.
#[derive(Default)]
struct Events {
    bus: Option<EventBus>,
}

impl Events {
    fn emit(&self, event: UpdaterEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: UpdaterConfig,
    credential: Credential,
    registry: Box<dyn JobRegistry>,
    poller: Arc<dyn BatchPoller>,
    mechanism: Option<Arc<dyn Mechanism>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    credential_path: Option<PathBuf>,
    origin: Option<String>,
}

impl EngineBuilder {
    /// Security mechanism used towards collectors (Noise XX by default).
    pub fn with_mechanism(mut self, mechanism: Arc<dyn Mechanism>) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscribe>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers.extend(subscribers);
        self
    }

    /// File the credential is re-acquired from when it nears expiry.
    /// Without one the initial credential is used until it expires.
    pub fn with_credential_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credential_path = Some(path.into());
        self
    }

    /// Origin reported in every update (host name by default).
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn build(self) -> Result<(Engine, EngineHandle), UpdaterError> {
        self.config.validate()?;
        for endpoint in &self.config.endpoints {
            let role = if endpoint.is_acceptor() {
                Role::Acceptor
            } else {
                Role::Initiator
            };
            if !self.credential.usage().permits(role) {
                return Err(CredentialError::WrongUsage {
                    principal: self.credential.principal().to_string(),
                    usage: role.as_str(),
                }
                .into());
            }
        }

        let (tx, control) = mpsc::channel(CONTROL_CAPACITY);
        let endpoints = self
            .config
            .endpoints
            .iter()
            .cloned()
            .map(Endpoint::new)
            .collect();
        let now = Instant::now();

        let engine = Engine {
            timers: Timers::start(now, &self.config),
            config: self.config,
            credential: self.credential,
            credential_path: self.credential_path,
            mechanism: self
                .mechanism
                .unwrap_or_else(|| Arc::new(NoiseMechanism)),
            registry: self.registry,
            poller: self.poller,
            subscribers: self.subscribers,
            origin: self
                .origin
                .unwrap_or_else(|| jobwire_core::origin().to_string()),
            endpoints,
            control,
            events: Events::default(),
            poll: None,
            last_listing: None,
            all_done: false,
            cursor: 0,
        };
        Ok((engine, EngineHandle::new(tx)))
    }
}

/// Secure job-state update propagator.
pub struct Engine {
    config: UpdaterConfig,
    credential: Credential,
    credential_path: Option<PathBuf>,
    mechanism: Arc<dyn Mechanism>,
    registry: Box<dyn JobRegistry>,
    poller: Arc<dyn BatchPoller>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    origin: String,
    endpoints: Vec<Endpoint>,
    control: mpsc::Receiver<Control>,
    events: Events,
    timers: Timers,
    poll: Option<BoxFuture<'static, PollDone>>,
    /// Job ids in the last successful listing.
    last_listing: Option<HashSet<JobId>>,
    /// No registered job is active; state queries slow down.
    all_done: bool,
    /// Rotates which endpoint is polled first.
    cursor: usize,
}

enum Turn {
    Shutdown,
    Control(Option<Control>),
    Poll(PollDone),
    Endpoint(usize, Wake),
    Tick,
}

impl Engine {
    pub fn builder(
        config: UpdaterConfig,
        credential: Credential,
        registry: impl JobRegistry + 'static,
        poller: Arc<dyn BatchPoller>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            credential,
            registry: Box::new(registry),
            poller,
            mechanism: None,
            subscribers: Vec::new(),
            credential_path: None,
            origin: None,
        }
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Fatal errors are an unusable credential that cannot be refreshed and a
    /// registry that cannot be read at startup.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), UpdaterError> {
        self.events.bus = Some(EventBus::spawn(&self.subscribers));
        let result = self.run_loop(&cancel).await;
        if let Err(e) = &result {
            warn!(error = %e, "updater stopped");
        }
        if let Some(bus) = self.events.bus.take() {
            bus.shutdown().await;
        }
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), UpdaterError> {
        self.check_credential()?;
        self.derive_queues()?;
        self.timers = Timers::start(Instant::now(), &self.config);
        info!(
            endpoints = self.endpoints.len(),
            origin = %self.origin,
            principal = self.credential.principal(),
            "updater started"
        );

        let mut control_open = true;
        let mut progress = Vec::new();
        loop {
            let now = Instant::now();
            self.run_due_timers(now)?;
            self.drive_links(now, &mut progress)?;

            let deadline = self.next_deadline();
            let start = self.cursor;
            self.cursor = self.cursor.wrapping_add(1);

            let turn = {
                let endpoints = &mut self.endpoints;
                let poll = &mut self.poll;
                let control = &mut self.control;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Turn::Shutdown,
                    msg = control.recv(), if control_open => Turn::Control(msg),
                    done = wait_poll(poll) => Turn::Poll(done),
                    (idx, wake) = wait_endpoints(endpoints, start) => Turn::Endpoint(idx, wake),
                    _ = tokio::time::sleep_until(deadline.into()) => Turn::Tick,
                }
            };

            match turn {
                Turn::Shutdown => {
                    info!("updater shutting down");
                    return Ok(());
                }
                Turn::Control(None) => control_open = false,
                Turn::Control(Some(msg)) => self.on_control(msg),
                Turn::Poll(done) => {
                    self.poll = None;
                    self.on_poll_done(done);
                }
                Turn::Endpoint(idx, wake) => {
                    let ctx = LinkCtx {
                        mechanism: self.mechanism.as_ref(),
                        credential: &self.credential,
                        config: &self.config,
                    };
                    self.endpoints[idx].handle(wake, &ctx, &mut progress);
                    self.absorb(idx, &mut progress)?;
                }
                Turn::Tick => {}
            }
        }
    }

    /// Start due connects or listens and expire overdue connects or handshakes.
    fn drive_links(&mut self, now: Instant, progress: &mut Vec<Progress>) -> Result<(), UpdaterError> {
        for idx in 0..self.endpoints.len() {
            let ep = &mut self.endpoints[idx];
            if ep.should_connect(now) && ep.is_acceptor() {
                ep.start_listen(&self.config, progress);
                self.absorb(idx, progress)?;
                continue;
            }
            if ep.should_connect(now) {
                ep.start_connect(self.config.connect_timeout());
                self.events.emit(
                    UpdaterEvent::new(EventKind::EndpointConnecting)
                        .with_endpoint(ep.name())
                        .with_queue_depth(ep.queue_depth()),
                );
                continue;
            }
            let ctx = LinkCtx {
                mechanism: self.mechanism.as_ref(),
                credential: &self.credential,
                config: &self.config,
            };
            ep.check_deadline(now, &ctx, progress);
            self.absorb(idx, progress)?;
        }
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        self.endpoints
            .iter()
            .filter_map(Endpoint::deadline)
            .fold(self.timers.nearest(self.poll.is_some()), Instant::min)
    }

    /// Account for everything endpoint `idx` reported.
    fn absorb(&mut self, idx: usize, progress: &mut Vec<Progress>) -> Result<(), UpdaterError> {
        let mut credential_failed = false;
        let mut follow = Vec::new();
        for item in progress.drain(..) {
            let ep = &self.endpoints[idx];
            let name = ep.name().to_string();
            match item {
                Progress::Listening { address } => {
                    self.events.emit(
                        UpdaterEvent::new(EventKind::EndpointListening)
                            .with_endpoint(name)
                            .with_reason(address.to_string()),
                    );
                }
                Progress::Received { update, peer } => match self.apply_inbound(&update, &peer) {
                    Ok(outcome) => {
                        debug!(endpoint = %name, job = %update.job_id, seq = update.seq, ?outcome, "peer update applied");
                        self.events.emit(
                            UpdaterEvent::new(EventKind::UpdateReceived)
                                .with_endpoint(name)
                                .with_job(&update.job_id)
                                .with_state(update.state)
                                .with_reason(peer),
                        );
                        self.endpoints[idx].confirm(update.seq, &self.config, &mut follow);
                    }
                    Err(e) => {
                        error!(endpoint = %name, job = %update.job_id, error = %e, "registry write failed; peer update left unacknowledged");
                        self.endpoints[idx].refuse(
                            format!("registry write failed: {e}"),
                            &self.config,
                            &mut follow,
                        );
                    }
                },
                Progress::Established { peer } => {
                    info!(endpoint = %name, %peer, "endpoint ready");
                    self.events.emit(
                        UpdaterEvent::new(EventKind::EndpointReady)
                            .with_endpoint(name)
                            .with_reason(peer)
                            .with_queue_depth(ep.queue_depth()),
                    );
                }
                Progress::Sent { job_id, state, seq } => {
                    debug!(endpoint = %name, job = %job_id, %state, seq, "update sent");
                    self.events.emit(
                        UpdaterEvent::new(EventKind::UpdateSent)
                            .with_endpoint(name)
                            .with_job(&job_id)
                            .with_state(state)
                            .with_queue_depth(ep.queue_depth()),
                    );
                }
                Progress::Acked(updates) => {
                    for update in updates {
                        self.record_ack(&name, &update.job_id, update.revision);
                        self.events.emit(
                            UpdaterEvent::new(EventKind::UpdateAcked)
                                .with_endpoint(name.clone())
                                .with_job(&update.job_id)
                                .with_state(update.state),
                        );
                    }
                }
                Progress::Failed(failure) => {
                    let status = ep.status();
                    let kind = if failure.clean {
                        debug!(endpoint = %name, reason = %failure.reason, "endpoint closed");
                        EventKind::EndpointClosed
                    } else {
                        warn!(
                            endpoint = %name,
                            reason = %failure.reason,
                            attempt = status.consecutive_failures,
                            "endpoint failed"
                        );
                        EventKind::EndpointFailed
                    };
                    self.events.emit(
                        UpdaterEvent::new(kind)
                            .with_endpoint(name.clone())
                            .with_reason(failure.reason.clone())
                            .with_attempt(status.consecutive_failures)
                            .with_queue_depth(status.queue_depth),
                    );
                    if failure.went_stale {
                        warn!(endpoint = %name, "endpoint marked stale until the next consistency check");
                        self.events.emit(
                            UpdaterEvent::new(EventKind::EndpointStale)
                                .with_endpoint(name.clone())
                                .with_attempt(status.consecutive_failures),
                        );
                    }
                    let owed = ep.pending_terminal_jobs();
                    self.record_delivery_failures(&name, &owed);
                    credential_failed |= failure.credential;
                }
            }
        }
        if !follow.is_empty() {
            self.absorb(idx, &mut follow)?;
        }
        if credential_failed {
            self.check_credential()?;
        }
        Ok(())
    }

    fn on_control(&mut self, msg: Control) {
        match msg {
            Control::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Control::Reconfigure { endpoints, reply } => {
                let result = validate_endpoints(&endpoints).map(|()| self.reconfigure(endpoints));
                if let Err(e) = &result {
                    warn!(error = %e, "reconfiguration rejected");
                }
                let _ = reply.send(result);
            }
        }
    }

    fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints.iter().map(Endpoint::status).collect()
    }

    /// Replace the endpoint set. Every link is closed; endpoints whose
    /// configuration is unchanged keep their undelivered updates in order.
    fn reconfigure(&mut self, configs: Vec<EndpointConfig>) {
        let mut old = mem::take(&mut self.endpoints);
        let mut carried = 0;
        for config in configs {
            let pending = old
                .iter()
                .position(|ep| ep.config() == &config)
                .map(|i| old.swap_remove(i).into_pending())
                .unwrap_or_default();
            carried += pending.len();
            self.endpoints.push(Endpoint::with_pending(config, pending));
        }
        let removed: Vec<String> = old.iter().map(|ep| ep.name().to_string()).collect();
        drop(old);

        self.config.endpoints = self
            .endpoints
            .iter()
            .map(|ep| ep.config().clone())
            .collect();
        if let Err(e) = self.derive_queues() {
            warn!(error = %e, "re-deriving queues after reconfiguration failed");
        }
        info!(
            endpoints = self.endpoints.len(),
            carried,
            removed = ?removed,
            "endpoints reconfigured"
        );
        self.events.emit(
            UpdaterEvent::new(EventKind::Reconfigured)
                .with_reason(format!("{} endpoints", self.endpoints.len())),
        );
    }
}

async fn wait_poll(poll: &mut Option<BoxFuture<'static, PollDone>>) -> PollDone {
    match poll {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

/// First endpoint with something to do, starting the scan at `start`.
async fn wait_endpoints(endpoints: &mut [Endpoint], start: usize) -> (usize, Wake) {
    if endpoints.is_empty() {
        return pending().await;
    }
    let n = endpoints.len();
    let mut waits: Vec<_> = endpoints
        .iter_mut()
        .enumerate()
        .map(|(idx, ep)| Box::pin(async move { (idx, ep.wait().await) }))
        .collect();
    waits.rotate_left(start % n);
    let (ready, _, _) = select_all(waits).await;
    ready
}
