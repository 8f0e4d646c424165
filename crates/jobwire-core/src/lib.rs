//! Configuration and the external seams of the updater.
//!
//! - [`JobRegistry`]: persistent job id -> [`JobRecord`](jobwire_model::JobRecord) map.
//! - [`BatchPoller`]: source of current and historical job states.
//! - [`Subscribe`]: consumer of [`UpdaterEvent`](jobwire_model::UpdaterEvent)s.

pub mod config;
pub use config::{
    BackoffConfig, EndpointConfig, EndpointRole, MAX_INTERVAL_SECS, UpdaterConfig,
    validate_endpoints,
};

pub mod error;
pub use error::{ConfigError, PollerError, RegistryError};

pub mod poller;
pub use poller::{BatchPoller, CommandPoller, ScriptedPoller};

pub mod registry;
pub use registry::{JobRegistry, JsonFileRegistry, MemoryRegistry};

pub mod subscribe;
pub use subscribe::{EventBus, Subscribe};

mod system;
pub use system::origin;
