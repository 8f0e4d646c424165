use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize registry: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unparseable scheduler line {line:?}: {reason}")]
    Parse { line: String, reason: String },
    #[error("scheduler query exceeded {0:?}")]
    Timeout(Duration),
    #[error("no final-state command configured")]
    NoHistory,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{name} must not exceed {max}")]
    TooLarge { name: &'static str, max: u64 },
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("duplicate endpoint name {0:?}")]
    DuplicateEndpoint(String),
    #[error("endpoint {name:?} has an invalid address {address:?}")]
    BadAddress { name: String, address: String },
    #[error("backoff factor must be at least 1.0, got {0}")]
    BackoffFactor(f64),
}
