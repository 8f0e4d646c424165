mod config;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use jobwire_core::{JsonFileRegistry, Subscribe};
use jobwire_observe::{Journal, init_logger};
use jobwire_prometheus::{PrometheusMetrics, TextEncoder};
use jobwire_secure::{CredentialUsage, acquire_credential};
use jobwire_updater::{Engine, EngineHandle};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::{AgentConfig, DEFAULT_CONFIG};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let cfg = AgentConfig::load(&path)?;

    init_logger(&cfg.logger)?;
    info!(config = %path.display(), "configuration loaded");

    let usage = if cfg.updater.endpoints.iter().any(|ep| ep.is_acceptor()) {
        CredentialUsage::Both
    } else {
        CredentialUsage::Initiate
    };
    let credential = acquire_credential(usage, cfg.credential.as_deref())
        .context("acquiring credential")?;
    let registry = JsonFileRegistry::open(&cfg.registry)?;
    let metrics = PrometheusMetrics::new()?;
    let subscribers: Vec<Arc<dyn Subscribe>> =
        vec![Arc::new(Journal::new()), Arc::new(metrics.clone())];

    let mut builder = Engine::builder(
        cfg.updater.clone(),
        credential,
        registry,
        Arc::new(cfg.poller.clone()),
    )
    .with_subscribers(subscribers);
    if let Some(credential_path) = &cfg.credential {
        builder = builder.with_credential_path(credential_path);
    }
    if let Some(origin) = &cfg.origin {
        builder = builder.with_origin(origin);
    }
    let (engine, handle) = builder.build()?;

    let cancel = CancellationToken::new();
    let mut engine_task = tokio::spawn(engine.run(cancel.clone()));
    let mut hangup = signal(SignalKind::hangup())?;
    let mut metrics_tick = tokio::time::interval(Duration::from_secs(cfg.metrics_interval_secs));
    info!("agent running; SIGHUP reloads endpoints");

    loop {
        tokio::select! {
            res = &mut engine_task => {
                res??;
                info!("updater stopped");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => reload(&path, &handle).await,
            _ = metrics_tick.tick() => {
                if let Some(file) = &cfg.metrics_file {
                    if let Err(e) = write_metrics(&metrics, file).await {
                        warn!(path = %file.display(), error = %e, "writing metrics failed");
                    }
                }
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    engine_task.await??;
    if let Some(file) = &cfg.metrics_file {
        write_metrics(&metrics, file).await?;
    }
    Ok(())
}

/// Re-read the configuration file and apply its endpoint list.
async fn reload(path: &Path, handle: &EngineHandle) {
    info!(config = %path.display(), "reloading endpoints");
    let cfg = match AgentConfig::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "reload skipped; keeping current endpoints");
            return;
        }
    };
    match handle.reconfigure(cfg.updater.endpoints).await {
        Ok(()) => debug!("endpoints reloaded"),
        Err(e) => warn!(error = %e, "reload rejected"),
    }
}

async fn write_metrics(metrics: &PrometheusMetrics, file: &Path) -> anyhow::Result<()> {
    let text = TextEncoder::new().encode_to_string(&metrics.gather())?;
    let mut tmp = file.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, file).await?;
    Ok(())
}
