use std::{collections::VecDeque, fmt};

use crate::{
    context::SecurityContext,
    credential::Credential,
    error::AuthError,
    mechanism::{Exchange, Mechanism},
};

/// Lifecycle of a security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Negotiating,
    Established,
    Failed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextState::Negotiating => "negotiating",
            ContextState::Established => "established",
            ContextState::Failed => "failed",
        })
    }
}

/// Side of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiate",
            Role::Acceptor => "accept",
        }
    }
}

/// What the driver of a [`Handshake`] must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Transmit this token to the peer.
    Send(Vec<u8>),
    /// Wait for the peer's next token and pass it to [`Handshake::receive`].
    Receive,
    /// Exchange finished; call [`Handshake::into_context`].
    Complete,
}

/// One token exchange, driven step by step.
///
/// The handshake does no I/O. The async drivers in [`crate::channel`] and the
/// updater's readiness loop both move it forward with the same calls:
///
/// ```text
/// loop {
///     match hs.next_step() {
///         Step::Send(t)  => send_token(t),
///         Step::Receive  => hs.receive(&receive_token())?,
///         Step::Complete => break hs.into_context()?,
///     }
/// }
/// ```
pub struct Handshake {
    role: Role,
    exchange: Option<Box<dyn Exchange>>,
    outbox: VecDeque<Vec<u8>>,
    complete: bool,
    state: ContextState,
    rounds: u32,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("complete", &self.complete)
            .field("rounds", &self.rounds)
            .field("pending", &self.outbox.len())
            .finish()
    }
}

impl Handshake {
    /// Start as initiator towards `target`; the first token is queued immediately.
    pub fn initiate(
        mechanism: &dyn Mechanism,
        credential: &Credential,
        target: &str,
    ) -> Result<Self, AuthError> {
        credential.check_usable(Role::Initiator)?;
        let exchange = mechanism.initiator(credential, target)?;
        let mut hs = Self::new(Role::Initiator, exchange);
        hs.advance(None)?;
        Ok(hs)
    }

    /// Start as acceptor; nothing is sent until the first peer token arrives.
    pub fn accept(mechanism: &dyn Mechanism, credential: &Credential) -> Result<Self, AuthError> {
        credential.check_usable(Role::Acceptor)?;
        let exchange = mechanism.acceptor(credential)?;
        Ok(Self::new(Role::Acceptor, exchange))
    }

    fn new(role: Role, exchange: Box<dyn Exchange>) -> Self {
        Self {
            role,
            exchange: Some(exchange),
            outbox: VecDeque::new(),
            complete: false,
            state: ContextState::Negotiating,
            rounds: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Number of exchange rounds processed so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn next_step(&mut self) -> Step {
        if let Some(token) = self.outbox.pop_front() {
            Step::Send(token)
        } else if self.complete {
            Step::Complete
        } else {
            Step::Receive
        }
    }

    /// Feed one token received from the peer.
    pub fn receive(&mut self, token: &[u8]) -> Result<(), AuthError> {
        if self.complete || self.state != ContextState::Negotiating {
            return Err(AuthError::NotNegotiating);
        }
        self.advance(Some(token))
    }

    fn advance(&mut self, input: Option<&[u8]>) -> Result<(), AuthError> {
        let exchange = self.exchange.as_mut().ok_or(AuthError::NotNegotiating)?;
        match exchange.advance(input) {
            Ok(status) => {
                self.rounds += 1;
                if let Some(token) = status.output {
                    self.outbox.push_back(token);
                }
                self.complete = status.complete;
                Ok(())
            }
            Err(e) => {
                self.state = ContextState::Failed;
                self.exchange = None;
                self.outbox.clear();
                Err(e)
            }
        }
    }

    /// Finish the exchange, requiring both mutual authentication and confidentiality.
    pub fn into_context(mut self) -> Result<SecurityContext, AuthError> {
        if !self.complete || !self.outbox.is_empty() || self.state != ContextState::Negotiating {
            return Err(AuthError::NotNegotiating);
        }
        let exchange = self.exchange.take().ok_or(AuthError::NotNegotiating)?;
        let established = exchange.establish()?;
        if !established.flags.mutual {
            return Err(AuthError::InsufficientProtection("mutual authentication"));
        }
        if !established.flags.confidential {
            return Err(AuthError::InsufficientProtection("confidentiality"));
        }
        Ok(SecurityContext::new(self.role, established))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        CredentialError, CredentialUsage,
        mechanism::{Cipher, CipherError, ContextFlags, Established, ExchangeStatus, NoiseMechanism},
    };

    fn creds() -> (Credential, Credential) {
        let a = Credential::generate("/CN=a", CredentialUsage::Both, Duration::from_secs(60)).unwrap();
        let b = Credential::generate("/CN=b", CredentialUsage::Both, Duration::from_secs(60)).unwrap();
        let (ak, bk) = (a.public_key().to_vec(), b.public_key().to_vec());
        (a.with_trusted("/CN=b", &bk), b.with_trusted("/CN=a", &ak))
    }

    fn pump(init: &mut Handshake, acc: &mut Handshake) {
        loop {
            let mut progressed = false;
            if let Step::Send(t) = init.next_step() {
                acc.receive(&t).unwrap();
                progressed = true;
            }
            if let Step::Send(t) = acc.next_step() {
                init.receive(&t).unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    #[test]
    fn steps_drive_to_completion() {
        let (a, b) = creds();
        let mut init = Handshake::initiate(&NoiseMechanism, &a, "/CN=b").unwrap();
        let mut acc = Handshake::accept(&NoiseMechanism, &b).unwrap();
        assert_eq!(acc.next_step(), Step::Receive);

        pump(&mut init, &mut acc);

        assert_eq!(init.next_step(), Step::Complete);
        assert_eq!(acc.next_step(), Step::Complete);
        let ctx = init.into_context().unwrap();
        assert!(ctx.is_established());
        assert_eq!(ctx.peer_name(), "/CN=b");
        assert_eq!(acc.into_context().unwrap().peer_name(), "/CN=a");
    }

    #[test]
    fn expired_credential_cannot_initiate() {
        let cred = Credential::generate("/CN=a", CredentialUsage::Both, Duration::ZERO).unwrap();
        assert!(matches!(
            Handshake::initiate(&NoiseMechanism, &cred, "/CN=b"),
            Err(AuthError::Credential(CredentialError::Expired { .. }))
        ));
    }

    #[test]
    fn failure_moves_to_failed_state() {
        let (_, b) = creds();
        let mut acc = Handshake::accept(&NoiseMechanism, &b).unwrap();
        assert!(acc.receive(b"not a noise message").is_err());
        assert_eq!(acc.state(), ContextState::Failed);
        assert!(matches!(acc.receive(b"again"), Err(AuthError::NotNegotiating)));
    }

    struct OneSided;
    struct NullCipher;

    impl Cipher for NullCipher {
        fn wrap(&mut self, p: &[u8]) -> Result<Vec<u8>, CipherError> {
            Ok(p.to_vec())
        }
        fn unwrap(&mut self, t: &[u8]) -> Result<Vec<u8>, CipherError> {
            Ok(t.to_vec())
        }
    }

    impl Exchange for OneSided {
        fn advance(&mut self, _: Option<&[u8]>) -> Result<ExchangeStatus, AuthError> {
            Ok(ExchangeStatus {
                output: None,
                complete: true,
            })
        }
        fn establish(self: Box<Self>) -> Result<Established, AuthError> {
            Ok(Established {
                cipher: Box::new(NullCipher),
                source_name: "a".into(),
                target_name: "b".into(),
                flags: ContextFlags {
                    mutual: true,
                    confidential: false,
                },
            })
        }
    }

    #[test]
    fn context_without_confidentiality_is_rejected() {
        let mut hs = Handshake::new(Role::Initiator, Box::new(OneSided));
        hs.advance(None).unwrap();
        assert!(matches!(
            hs.into_context(),
            Err(AuthError::InsufficientProtection("confidentiality"))
        ));
    }
}
