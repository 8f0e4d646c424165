//! Token-exchange primitive seam.
//!
//! A [`Mechanism`] produces one [`Exchange`] per connection attempt. The
//! exchange consumes peer tokens and emits its own until it reports completion,
//! then yields an [`Established`] context holding the [`Cipher`] used for
//! wrapping application messages.

pub(crate) mod noise;

pub use noise::NoiseMechanism;

use thiserror::Error;

use crate::{credential::Credential, error::AuthError};

/// Protection properties achieved by a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextFlags {
    pub mutual: bool,
    pub confidential: bool,
}

/// Output of one exchange round.
#[derive(Debug, Default)]
pub struct ExchangeStatus {
    /// Token to transmit to the peer, if any.
    pub output: Option<Vec<u8>>,
    /// No further tokens are expected from the peer.
    pub complete: bool,
}

/// Outcome of a completed exchange.
pub struct Established {
    pub cipher: Box<dyn Cipher>,
    /// Principal of the initiating side.
    pub source_name: String,
    /// Principal of the accepting side.
    pub target_name: String,
    pub flags: ContextFlags,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Per-message protection of an established context.
pub trait Cipher: Send {
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn unwrap(&mut self, token: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// One in-progress token exchange.
pub trait Exchange: Send {
    /// Feed the peer's token (`None` for the initiator's opening round).
    fn advance(&mut self, input: Option<&[u8]>) -> Result<ExchangeStatus, AuthError>;

    /// Turn a completed exchange into an established context.
    fn establish(self: Box<Self>) -> Result<Established, AuthError>;
}

/// Factory of exchanges.
pub trait Mechanism: Send + Sync {
    fn name(&self) -> &'static str;

    fn initiator(
        &self,
        credential: &Credential,
        target: &str,
    ) -> Result<Box<dyn Exchange>, AuthError>;

    fn acceptor(&self, credential: &Credential) -> Result<Box<dyn Exchange>, AuthError>;
}
