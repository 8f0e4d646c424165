//! Mutually authenticated, confidential messaging over a raw byte stream.
//!
//! ## Layers
//! - [`framer`]: `[u32 BE length][payload]` token framing, async and incremental.
//! - [`credential`]: process identity (principal, static key, expiry, trusted peers).
//! - [`mechanism`]: the token-exchange primitive seam, with a Noise XX implementation.
//! - [`Handshake`]: step object driving one exchange (`Send` / `Receive` / `Complete`).
//! - [`SecurityContext`]: established context used to wrap and unwrap messages.
//! - [`channel`]: async drivers (`initiate`, `accept`, `wrap_and_send`, `receive_and_unwrap`).
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use jobwire_secure::{CredentialUsage, NoiseMechanism, acquire_credential, channel};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cred = acquire_credential(CredentialUsage::Initiate, None)?;
//! let mut conn = tokio::net::TcpStream::connect("collector.example.org:7443").await?;
//! let mut ctx = channel::initiate(
//!     &NoiseMechanism,
//!     &cred,
//!     "/DC=org/CN=collector.example.org",
//!     &mut conn,
//!     Duration::from_secs(30),
//! )
//! .await?;
//! channel::wrap_and_send(&mut ctx, b"hello", &mut conn).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod credential;
pub mod framer;
pub mod mechanism;

mod context;
mod error;
mod handshake;
mod message;
mod names;

pub use context::SecurityContext;
pub use credential::{
    CREDENTIAL_ENV, Credential, CredentialUsage, TrustStore, acquire_credential,
    credential_lifetime,
};
pub use error::{AuthError, ChannelError, CredentialError, FrameError};
pub use handshake::{ContextState, Handshake, Role, Step};
pub use mechanism::{Mechanism, NoiseMechanism};
pub use message::Message;
pub use names::{PROXY_SUFFIX, names_match, strip_proxy_suffixes, verify_peer_match};
