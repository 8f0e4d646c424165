use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound for any interval or timeout (ten years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 3_600;

/// Reconnect backoff: `first_ms * factor^(attempt - 1)`, capped at `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first_ms: 1_000,
            max_ms: 300_000,
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = (self.first_ms as f64) * self.factor.powi(exp);
        let capped = if ms.is_finite() {
            ms.min(self.max_ms as f64)
        } else {
            self.max_ms as f64
        };
        Duration::from_millis(capped as u64)
    }
}

/// Which side of the handshake an endpoint takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Connect out to a collector and deliver updates to it.
    #[default]
    Initiator,
    /// Listen for peer updaters and apply the updates they deliver.
    Acceptor,
}

/// One remote collector, or a listener for peer updaters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Stable name; keys the per-endpoint delivery bookkeeping in the registry.
    pub name: String,
    /// `host:port` to connect to, or to listen on for acceptors.
    pub address: String,
    /// Expected peer principal. When absent the peer must carry this agent's
    /// own identity (possibly delegated).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    #[serde(default)]
    pub role: EndpointRole,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            peer_name: None,
            role: EndpointRole::Initiator,
        }
    }

    /// Listening endpoint accepting updates from peer updaters on `address`.
    pub fn acceptor(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            role: EndpointRole::Acceptor,
            ..Self::new(name, address)
        }
    }

    pub fn is_acceptor(&self) -> bool {
        self.role == EndpointRole::Acceptor
    }

    pub fn with_peer_name(mut self, peer_name: impl Into<String>) -> Self {
        self.peer_name = Some(peer_name.into());
        self
    }
}

/// Updater timers, limits and endpoints. Every interval is whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdaterConfig {
    /// Batch system state query period.
    pub query_interval_secs: u64,
    /// History lookup period for jobs that vanished from the listing.
    pub final_query_interval_secs: u64,
    /// Minimum age of a terminal record before it may be purged.
    pub purge_interval_secs: u64,
    /// State query period while no job is active.
    pub alldone_interval_secs: u64,
    /// Staleness, credential and queue re-derivation period.
    pub consistency_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub poll_timeout_secs: u64,
    /// Failures in a row (no successful handshake between them) within one
    /// consistency window before an endpoint goes stale.
    pub max_consecutive_failures: u32,
    /// Failed delivery rounds after which a terminal job may be purged anyway.
    pub max_delivery_attempts: u32,
    pub max_queue_depth: usize,
    pub backoff: BackoffConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            query_interval_secs: 5,
            final_query_interval_secs: 30,
            purge_interval_secs: 864_000,
            alldone_interval_secs: 36_000,
            consistency_interval_secs: 3_600,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            poll_timeout_secs: 60,
            max_consecutive_failures: 5,
            max_delivery_attempts: 20,
            max_queue_depth: 1_024,
            backoff: BackoffConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

impl UpdaterConfig {
    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_secs)
    }

    pub fn final_query_interval(&self) -> Duration {
        Duration::from_secs(self.final_query_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn alldone_interval(&self) -> Duration {
        Duration::from_secs(self.alldone_interval_secs)
    }

    pub fn consistency_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("query_interval_secs", self.query_interval_secs),
            ("final_query_interval_secs", self.final_query_interval_secs),
            ("purge_interval_secs", self.purge_interval_secs),
            ("alldone_interval_secs", self.alldone_interval_secs),
            ("consistency_interval_secs", self.consistency_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("poll_timeout_secs", self.poll_timeout_secs),
        ];
        let limits = [
            ("max_consecutive_failures", self.max_consecutive_failures as u64),
            ("max_delivery_attempts", self.max_delivery_attempts as u64),
            ("max_queue_depth", self.max_queue_depth as u64),
        ];
        if let Some((name, _)) = durations.iter().chain(&limits).find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v > MAX_INTERVAL_SECS) {
            return Err(ConfigError::TooLarge {
                name: *name,
                max: MAX_INTERVAL_SECS,
            });
        }
        if self.backoff.max_ms / 1_000 > MAX_INTERVAL_SECS {
            return Err(ConfigError::TooLarge {
                name: "backoff.max_ms",
                max: MAX_INTERVAL_SECS * 1_000,
            });
        }
        if !(self.backoff.factor >= 1.0) {
            return Err(ConfigError::BackoffFactor(self.backoff.factor));
        }
        validate_endpoints(&self.endpoints)
    }
}

/// Endpoint list checks shared by startup and reload.
pub fn validate_endpoints(endpoints: &[EndpointConfig]) -> Result<(), ConfigError> {
    if endpoints.is_empty() {
        return Err(ConfigError::NoEndpoints);
    }
    let mut seen = HashSet::new();
    for ep in endpoints {
        if !seen.insert(ep.name.as_str()) {
            return Err(ConfigError::DuplicateEndpoint(ep.name.clone()));
        }
        let valid = ep
            .address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(ConfigError::BadAddress {
                name: ep.name.clone(),
                address: ep.address.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_endpoints() -> UpdaterConfig {
        UpdaterConfig {
            endpoints: vec![EndpointConfig::new("central", "collector.example.org:7443")],
            ..UpdaterConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_timers() {
        let cfg = UpdaterConfig::default();
        assert_eq!(cfg.query_interval(), Duration::from_secs(5));
        assert_eq!(cfg.final_query_interval(), Duration::from_secs(30));
        assert_eq!(cfg.purge_interval(), Duration::from_secs(864_000));
        assert_eq!(cfg.alldone_interval(), Duration::from_secs(36_000));
        assert_eq!(cfg.consistency_interval(), Duration::from_secs(3_600));
    }

    #[test]
    fn toml_overrides_keep_defaults() {
        let cfg: UpdaterConfig = toml::from_str(
            r#"
            query_interval_secs = 2

            [[endpoints]]
            name = "central"
            address = "127.0.0.1:7443"
            peer_name = "/CN=collector"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.query_interval_secs, 2);
        assert_eq!(cfg.purge_interval_secs, 864_000);
        assert_eq!(cfg.endpoints[0].peer_name.as_deref(), Some("/CN=collector"));
        assert_eq!(cfg.endpoints[0].role, EndpointRole::Initiator);
        cfg.validate().unwrap();
    }

    #[test]
    fn acceptor_role_parses() {
        let cfg: UpdaterConfig = toml::from_str(
            r#"
            [[endpoints]]
            name = "peers"
            address = "0.0.0.0:7444"
            role = "acceptor"
            "#,
        )
        .unwrap();
        assert!(cfg.endpoints[0].is_acceptor());
        assert_eq!(cfg.endpoints[0], EndpointConfig::acceptor("peers", "0.0.0.0:7444"));
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let mut cfg = with_endpoints();
        cfg.query_interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Zero("query_interval_secs"))));

        assert!(matches!(
            UpdaterConfig::default().validate(),
            Err(ConfigError::NoEndpoints)
        ));

        let mut cfg = with_endpoints();
        cfg.endpoints.push(EndpointConfig::new("central", "other:1"));
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateEndpoint(_))));

        let mut cfg = with_endpoints();
        cfg.endpoints[0].address = "no-port".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::BadAddress { .. })));
    }

    #[test]
    fn huge_intervals_are_rejected() {
        let mut cfg = with_endpoints();
        cfg.purge_interval_secs = u64::MAX;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooLarge {
                name: "purge_interval_secs",
                ..
            })
        ));

        let mut cfg = with_endpoints();
        cfg.consistency_interval_secs = MAX_INTERVAL_SECS;
        cfg.validate().unwrap();
        let _ = std::time::Instant::now() + cfg.consistency_interval();

        let mut cfg = with_endpoints();
        cfg.backoff.max_ms = u64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::TooLarge { .. })));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b = BackoffConfig {
            first_ms: 100,
            max_ms: 1_000,
            factor: 2.0,
        };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(3), Duration::from_millis(400));
        assert_eq!(b.delay(10), Duration::from_millis(1_000));
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(1_000));
    }
}
