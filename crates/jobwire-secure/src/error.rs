use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{framer::MAX_TOKEN_LEN, handshake::ContextState};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    Eof,
    #[error("connection closed mid-frame ({read} of {expected} bytes)")]
    Truncated { read: usize, expected: usize },
    #[error("token of {0} bytes exceeds the {max} byte limit", max = MAX_TOKEN_LEN)]
    Oversized(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential configured (set a credential path or {})", crate::CREDENTIAL_ENV)]
    Missing,
    #[error("failed to read credential {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write credential {}: {source}", .path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("credential for {principal} has expired")]
    Expired { principal: String },
    #[error("credential for {principal} cannot be used to {usage}")]
    WrongUsage {
        principal: String,
        usage: &'static str,
    },
    #[error("failed to query credential lifetime: {0}")]
    Query(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("peer presented a key that is not trusted")]
    UntrustedPeer,
    #[error("peer claims {claimed} but its key is trusted as {trusted}")]
    IdentityMismatch { claimed: String, trusted: String },
    #[error("negotiated context lacks {0}")]
    InsufficientProtection(&'static str),
    #[error("peer identity {actual} does not match expected {expected}")]
    PeerMismatch { expected: String, actual: String },
    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),
    #[error("handshake is not in progress")]
    NotNegotiating,
    #[error("handshake transport failure: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl AuthError {
    /// Peer hung up cleanly during the exchange.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, AuthError::Frame(FrameError::Eof))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer closed the connection")]
    Closed,
    #[error("corrupt token: {0}")]
    Corrupt(String),
    #[error("failed to unwrap token: {0}")]
    Unwrap(String),
    #[error("failed to wrap message: {0}")]
    Wrap(String),
    #[error("security context is {0}")]
    Unusable(ContextState),
    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl ChannelError {
    /// Clean remote close, a reconnect trigger rather than an anomaly.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Eof => ChannelError::Closed,
            FrameError::Truncated { .. } | FrameError::Oversized(_) => {
                ChannelError::Corrupt(e.to_string())
            }
            FrameError::Io(io) => ChannelError::Io(io),
        }
    }
}
