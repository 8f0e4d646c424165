use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use jobwire_core::{CommandPoller, MAX_INTERVAL_SECS, UpdaterConfig};
use jobwire_observe::LoggerConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG: &str = "/etc/jobwire/agent.toml";

/// Agent configuration file.
///
/// ```toml
/// registry = "/var/lib/jobwire/registry.json"
/// credential = "/etc/jobwire/credential.toml"
///
/// [logger]
/// format = "journald"
///
/// [poller]
/// list = ["/usr/libexec/jobwire/list-jobs"]
/// history = ["/usr/libexec/jobwire/job-history"]
///
/// [updater]
/// query_interval_secs = 5
///
/// [[updater.endpoints]]
/// name = "central"
/// address = "collector.example.org:7443"
///
/// [[updater.endpoints]]
/// name = "peers"
/// address = "0.0.0.0:7444"
/// role = "acceptor"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Credential file; falls back to the credential environment variable.
    #[serde(default)]
    pub credential: Option<PathBuf>,
    pub registry: PathBuf,
    /// Reported origin; the host name when absent.
    #[serde(default)]
    pub origin: Option<String>,
    pub poller: CommandPoller,
    /// Prometheus text exposition file, rewritten every `metrics_interval_secs`.
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
    #[serde(default)]
    pub updater: UpdaterConfig,
}

fn default_metrics_interval() -> u64 {
    60
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        cfg.updater
            .validate()
            .with_context(|| format!("validating configuration {}", path.display()))?;
        if cfg.metrics_interval_secs == 0 || cfg.metrics_interval_secs > MAX_INTERVAL_SECS {
            anyhow::bail!("metrics_interval_secs must be between 1 and {MAX_INTERVAL_SECS}");
        }
        Ok(cfg)
    }
}
