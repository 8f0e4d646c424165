use std::io;

use jobwire_core::{ConfigError, RegistryError};
use jobwire_model::WireError;
use jobwire_secure::{AuthError, ChannelError, CredentialError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("credential unusable: {0}")]
    Credential(#[from] CredentialError),

    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("engine is no longer running")]
    EngineGone,
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("channel failed: {0}")]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("peer '{peer}' is not the expected agent")]
    Rejected { peer: String },
}
