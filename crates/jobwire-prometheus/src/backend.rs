use async_trait::async_trait;
use jobwire_core::Subscribe;
use jobwire_model::{EventKind, UpdaterEvent};
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, proto::MetricFamily};

/// Updater metrics on a private registry. Clones share the same collectors.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    sent: IntCounterVec,
    acked: IntCounterVec,
    received: IntCounterVec,
    coalesced: IntCounterVec,
    failures: IntCounterVec,
    queue_depth: IntGaugeVec,
    transitions: IntCounterVec,
    rejected: IntCounter,
    purged: IntCounter,
    poll_failures: IntCounter,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Register the collectors on an existing registry.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let counter_vec = |name: &str, help: &str, labels: &[&str]| {
            let c = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(c.clone()))?;
            Ok::<_, prometheus::Error>(c)
        };
        let counter = |name: &str, help: &str| {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok::<_, prometheus::Error>(c)
        };

        let sent = counter_vec(
            "jobwire_updates_sent_total",
            "Updates written to a collector",
            &["endpoint"],
        )?;
        let acked = counter_vec(
            "jobwire_updates_acked_total",
            "Updates acknowledged by a collector",
            &["endpoint"],
        )?;
        let received = counter_vec(
            "jobwire_updates_received_total",
            "Updates received from peer updaters on a listening endpoint",
            &["endpoint"],
        )?;
        let coalesced = counter_vec(
            "jobwire_updates_coalesced_total",
            "Superseded updates dropped from a full queue",
            &["endpoint"],
        )?;
        let failures = counter_vec(
            "jobwire_endpoint_failures_total",
            "Collector links torn down, by kind (failed, closed)",
            &["endpoint", "kind"],
        )?;
        let transitions = counter_vec(
            "jobwire_transitions_total",
            "Job state transitions applied to the registry, by new state",
            &["state"],
        )?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("jobwire_queue_depth", "Updates waiting to be written per collector"),
            &["endpoint"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            sent,
            acked,
            received,
            coalesced,
            failures,
            queue_depth,
            transitions,
            rejected: counter(
                "jobwire_transitions_rejected_total",
                "Observations that would break monotonicity",
            )?,
            purged: counter(
                "jobwire_jobs_purged_total",
                "Finished jobs removed from the registry",
            )?,
            poll_failures: counter("jobwire_poll_failures_total", "Failed batch system queries")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    fn record(&self, e: &UpdaterEvent) {
        let endpoint = e.endpoint.as_deref().unwrap_or("");
        if let Some(depth) = e.queue_depth {
            if !endpoint.is_empty() {
                self.queue_depth
                    .with_label_values(&[endpoint])
                    .set(i64::try_from(depth).unwrap_or(i64::MAX));
            }
        }

        match e.kind {
            EventKind::UpdateSent => self.sent.with_label_values(&[endpoint]).inc(),
            EventKind::UpdateAcked => self.acked.with_label_values(&[endpoint]).inc(),
            EventKind::UpdateReceived => self.received.with_label_values(&[endpoint]).inc(),
            EventKind::UpdateCoalesced => self.coalesced.with_label_values(&[endpoint]).inc(),
            EventKind::EndpointFailed => {
                self.failures.with_label_values(&[endpoint, "failed"]).inc()
            }
            EventKind::EndpointClosed => {
                self.failures.with_label_values(&[endpoint, "closed"]).inc()
            }
            EventKind::JobTransition => {
                let state = e.state.map_or("unknown", |s| s.as_str());
                self.transitions.with_label_values(&[state]).inc();
            }
            EventKind::TransitionRejected => self.rejected.inc(),
            EventKind::JobPurged => self.purged.inc(),
            EventKind::PollFailed => self.poll_failures.inc(),
            EventKind::EndpointConnecting
            | EventKind::EndpointListening
            | EventKind::EndpointReady
            | EventKind::EndpointStale
            | EventKind::EndpointRevived
            | EventKind::UpdateQueued
            | EventKind::CredentialRefreshed
            | EventKind::Reconfigured => {}
        }
    }
}

#[async_trait]
impl Subscribe for PrometheusMetrics {
    async fn on_event(&self, event: &UpdaterEvent) {
        self.record(event);
    }

    fn name(&self) -> &'static str {
        "prometheus"
    }
}
