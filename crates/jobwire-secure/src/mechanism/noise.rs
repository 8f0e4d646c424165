//! Noise XX token exchange.
//!
//! Three messages: `-> e`, `<- e, ee, s, es`, `-> s, se`. Each side sends its
//! principal name as the encrypted payload of the message that carries its
//! static key; the receiver accepts the claim only if that static key is in its
//! trust store under exactly that principal.

use snow::{Builder as NoiseBuilder, HandshakeState, TransportState, params::NoiseParams};
use tracing::trace;

use super::{Cipher, CipherError, ContextFlags, Established, Exchange, ExchangeStatus, Mechanism};
use crate::{
    credential::{Credential, TrustStore},
    error::AuthError,
    handshake::Role,
};

const NOISE_PROTOCOL: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";
const PROLOGUE: &[u8] = b"jobwire/secure/v1";
const MAX_NOISE_MSG: usize = 65_535;
const TAG_LEN: usize = 16;

fn params() -> Result<NoiseParams, snow::Error> {
    NOISE_PROTOCOL.parse()
}

/// Fresh static X25519 keypair as `(private, public)`.
pub(crate) fn generate_keypair() -> Result<(Vec<u8>, Vec<u8>), snow::Error> {
    let keypair = NoiseBuilder::new(params()?).generate_keypair()?;
    Ok((keypair.private, keypair.public))
}

fn exchange_err(err: snow::Error) -> AuthError {
    AuthError::Exchange(err.to_string())
}

/// Noise-based [`Mechanism`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseMechanism;

impl NoiseMechanism {
    fn build(&self, credential: &Credential, role: Role) -> Result<HandshakeState, AuthError> {
        let builder = NoiseBuilder::new(params().map_err(exchange_err)?)
            .prologue(PROLOGUE)
            .local_private_key(credential.private_key());
        match role {
            Role::Initiator => builder.build_initiator(),
            Role::Acceptor => builder.build_responder(),
        }
        .map_err(exchange_err)
    }
}

impl Mechanism for NoiseMechanism {
    fn name(&self) -> &'static str {
        NOISE_PROTOCOL
    }

    fn initiator(
        &self,
        credential: &Credential,
        target: &str,
    ) -> Result<Box<dyn Exchange>, AuthError> {
        trace!(local = credential.principal(), target, "noise initiator");
        Ok(Box::new(NoiseExchange::new(
            Role::Initiator,
            self.build(credential, Role::Initiator)?,
            credential,
        )))
    }

    fn acceptor(&self, credential: &Credential) -> Result<Box<dyn Exchange>, AuthError> {
        trace!(local = credential.principal(), "noise acceptor");
        Ok(Box::new(NoiseExchange::new(
            Role::Acceptor,
            self.build(credential, Role::Acceptor)?,
            credential,
        )))
    }
}

struct NoiseExchange {
    role: Role,
    state: HandshakeState,
    local_name: String,
    remote_name: Option<String>,
    trust: TrustStore,
    round: u8,
}

impl NoiseExchange {
    fn new(role: Role, state: HandshakeState, credential: &Credential) -> Self {
        Self {
            role,
            state,
            local_name: credential.principal().to_string(),
            remote_name: None,
            trust: credential.trust().clone(),
            round: 0,
        }
    }

    fn write(&mut self, payload: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut buf = vec![0u8; MAX_NOISE_MSG];
        let len = self
            .state
            .write_message(payload, &mut buf)
            .map_err(exchange_err)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn read(&mut self, token: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut buf = vec![0u8; MAX_NOISE_MSG];
        let len = self
            .state
            .read_message(token, &mut buf)
            .map_err(exchange_err)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Check the principal the peer claimed against the key it proved.
    fn verify_remote(&mut self, payload: &[u8]) -> Result<(), AuthError> {
        let claimed = std::str::from_utf8(payload)
            .map_err(|_| AuthError::Exchange("peer principal is not valid UTF-8".into()))?;
        let key = self
            .state
            .get_remote_static()
            .ok_or_else(|| AuthError::Exchange("peer sent no static key".into()))?;
        let trusted = self
            .trust
            .principal_for(key)
            .ok_or(AuthError::UntrustedPeer)?;
        if trusted != claimed {
            return Err(AuthError::IdentityMismatch {
                claimed: claimed.to_string(),
                trusted: trusted.to_string(),
            });
        }
        self.remote_name = Some(claimed.to_string());
        Ok(())
    }

    fn unexpected(&self, input: Option<&[u8]>) -> AuthError {
        AuthError::Exchange(format!(
            "unexpected {} in round {} as {}",
            if input.is_some() { "token" } else { "empty input" },
            self.round,
            self.role.as_str()
        ))
    }
}

impl Exchange for NoiseExchange {
    fn advance(&mut self, input: Option<&[u8]>) -> Result<ExchangeStatus, AuthError> {
        let status = match (self.role, self.round, input) {
            (Role::Initiator, 0, None) => ExchangeStatus {
                output: Some(self.write(&[])?),
                complete: false,
            },
            (Role::Initiator, 1, Some(token)) => {
                let payload = self.read(token)?;
                self.verify_remote(&payload)?;
                let name = self.local_name.clone();
                ExchangeStatus {
                    output: Some(self.write(name.as_bytes())?),
                    complete: true,
                }
            }
            (Role::Acceptor, 0, Some(token)) => {
                self.read(token)?;
                let name = self.local_name.clone();
                ExchangeStatus {
                    output: Some(self.write(name.as_bytes())?),
                    complete: false,
                }
            }
            (Role::Acceptor, 1, Some(token)) => {
                let payload = self.read(token)?;
                self.verify_remote(&payload)?;
                ExchangeStatus {
                    output: None,
                    complete: true,
                }
            }
            _ => return Err(self.unexpected(input)),
        };
        self.round += 1;
        Ok(status)
    }

    fn establish(self: Box<Self>) -> Result<Established, AuthError> {
        let this = *self;
        if !this.state.is_handshake_finished() {
            return Err(AuthError::Exchange("handshake not finished".into()));
        }
        let remote = this
            .remote_name
            .ok_or_else(|| AuthError::Exchange("peer identity not verified".into()))?;
        let transport = this.state.into_transport_mode().map_err(exchange_err)?;

        let (source_name, target_name) = match this.role {
            Role::Initiator => (this.local_name, remote),
            Role::Acceptor => (remote, this.local_name),
        };
        Ok(Established {
            cipher: Box::new(NoiseCipher { transport }),
            source_name,
            target_name,
            flags: ContextFlags {
                mutual: true,
                confidential: true,
            },
        })
    }
}

struct NoiseCipher {
    transport: TransportState,
}

impl Cipher for NoiseCipher {
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if plaintext.len() + TAG_LEN > MAX_NOISE_MSG {
            return Err(CipherError(format!(
                "message of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                MAX_NOISE_MSG - TAG_LEN
            )));
        }
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self
            .transport
            .write_message(plaintext, &mut buf)
            .map_err(|e| CipherError(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    fn unwrap(&mut self, token: &[u8]) -> Result<Vec<u8>, CipherError> {
        if token.len() > MAX_NOISE_MSG {
            return Err(CipherError(format!("token of {} bytes is too long", token.len())));
        }
        let mut buf = vec![0u8; token.len()];
        let len = self
            .transport
            .read_message(token, &mut buf)
            .map_err(|e| CipherError(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }
}
