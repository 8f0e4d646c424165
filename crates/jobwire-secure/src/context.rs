use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::ChannelError,
    handshake::{ContextState, Role},
    mechanism::{Cipher, Established},
    message::Message,
};

/// Established security context of one connection.
///
/// Created by [`crate::Handshake::into_context`]. Any wrap or unwrap failure
/// moves it to [`ContextState::Failed`], after which it refuses all work and the
/// owner must renegotiate on a fresh connection.
pub struct SecurityContext {
    role: Role,
    state: ContextState,
    cipher: Box<dyn Cipher>,
    source_name: String,
    target_name: String,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("source_name", &self.source_name)
            .field("target_name", &self.target_name)
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    pub(crate) fn new(role: Role, established: Established) -> Self {
        Self {
            role,
            state: ContextState::Established,
            cipher: established.cipher,
            source_name: established.source_name,
            target_name: established.target_name,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ContextState::Established
    }

    /// Principal of the initiating side.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Principal of the accepting side.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Verified identity of the remote side.
    pub fn peer_name(&self) -> &str {
        match self.role {
            Role::Initiator => &self.target_name,
            Role::Acceptor => &self.source_name,
        }
    }

    pub fn local_name(&self) -> &str {
        match self.role {
            Role::Initiator => &self.source_name,
            Role::Acceptor => &self.target_name,
        }
    }

    /// Mark the context unusable.
    pub fn fail(&mut self) {
        if self.state != ContextState::Failed {
            debug!(peer = %self.peer_name(), "security context failed");
            self.state = ContextState::Failed;
        }
    }

    fn ensure_usable(&self) -> Result<(), ChannelError> {
        match self.state {
            ContextState::Established => Ok(()),
            other => Err(ChannelError::Unusable(other)),
        }
    }

    /// Confidentiality-protect `plaintext` into a token.
    pub fn wrap(&mut self, plaintext: &[u8]) -> Result<Bytes, ChannelError> {
        self.ensure_usable()?;
        match self.cipher.wrap(plaintext) {
            Ok(token) => Ok(Bytes::from(token)),
            Err(e) => {
                self.fail();
                Err(ChannelError::Wrap(e.to_string()))
            }
        }
    }

    /// Decrypt and integrity-check one token.
    pub fn unwrap(&mut self, token: &[u8]) -> Result<Message, ChannelError> {
        self.ensure_usable()?;
        match self.cipher.unwrap(token) {
            Ok(plain) => Ok(Message::from(plain)),
            Err(e) => {
                self.fail();
                Err(ChannelError::Unwrap(e.to_string()))
            }
        }
    }
}
