//! Propagates job state transitions from the local batch system to remote
//! collectors over mutually authenticated, confidential channels.
//!
//! ## Flow
//! ```text
//! BatchPoller ──► Engine ──► JobRegistry (revision, per-endpoint acks)
//!                   │
//!                   ├──► Endpoint "a" ──► queue ──► SecurityContext ──► collector a
//!                   └──► Endpoint "b" ──► queue ──► SecurityContext ──► collector b
//! ```
//!
//! A single [`Engine`] task owns every endpoint and multiplexes their sockets
//! on readiness. Each endpoint delivers its updates strictly in order and
//! re-sends everything unacknowledged after a reconnect.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use jobwire_core::{CommandPoller, EndpointConfig, JsonFileRegistry, UpdaterConfig};
//! use jobwire_secure::{CredentialUsage, acquire_credential};
//! use jobwire_updater::Engine;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UpdaterConfig {
//!     endpoints: vec![EndpointConfig::new("central", "collector.example.org:7443")],
//!     ..UpdaterConfig::default()
//! };
//! let credential = acquire_credential(CredentialUsage::Initiate, None)?;
//! let registry = JsonFileRegistry::open("/var/lib/jobwire/registry.json")?;
//! let poller = Arc::new(CommandPoller::new(vec!["qstat-lines".into()]));
//!
//! let (engine, handle) = Engine::builder(config, credential, registry, poller).build()?;
//! let cancel = CancellationToken::new();
//! tokio::spawn(engine.run(cancel.clone()));
//!
//! for status in handle.status().await? {
//!     println!("{} {}", status.name, status.state);
//! }
//! # Ok(())
//! # }
//! ```

mod collector;
mod endpoint;
mod engine;
mod errors;
mod handle;

pub use collector::{Collector, Received};
pub use endpoint::{EndpointState, EndpointStatus, SEND_WINDOW};
pub use engine::{Engine, EngineBuilder};
pub use errors::{CollectorError, UpdaterError};
pub use handle::EngineHandle;
