//! Async drivers over a connected byte stream.
//!
//! Each call owns the stream exclusively for its duration. The updater engine
//! does not use these; it steps [`Handshake`] from its own readiness loop.

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    context::SecurityContext,
    credential::Credential,
    error::{AuthError, ChannelError},
    framer::{receive_token, send_token},
    handshake::{Handshake, Step},
    mechanism::Mechanism,
    message::Message,
    names::names_match,
};

/// Authenticate to the peer expected to be `peer_name`.
///
/// The verified peer identity must match `peer_name` under the proxy-suffix
/// rule; on mismatch the context is discarded before any application data is sent.
pub async fn initiate<S>(
    mechanism: &dyn Mechanism,
    credential: &Credential,
    peer_name: &str,
    conn: &mut S,
    deadline: Duration,
) -> Result<SecurityContext, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake::initiate(mechanism, credential, peer_name)?;
    let ctx = timeout(deadline, drive(handshake, conn))
        .await
        .map_err(|_| AuthError::Timeout(deadline))??;

    if !names_match(ctx.peer_name(), peer_name) {
        warn!(expected = peer_name, actual = ctx.peer_name(), "peer identity mismatch");
        return Err(AuthError::PeerMismatch {
            expected: peer_name.to_string(),
            actual: ctx.peer_name().to_string(),
        });
    }
    debug!(peer = ctx.peer_name(), "security context established");
    Ok(ctx)
}

/// Authenticate an inbound peer; returns the context and the peer's verified identity.
pub async fn accept<S>(
    mechanism: &dyn Mechanism,
    credential: &Credential,
    conn: &mut S,
    deadline: Duration,
) -> Result<(SecurityContext, String), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake::accept(mechanism, credential)?;
    let ctx = timeout(deadline, drive(handshake, conn))
        .await
        .map_err(|_| AuthError::Timeout(deadline))??;
    let peer = ctx.peer_name().to_string();
    debug!(peer = %peer, "accepted security context");
    Ok((ctx, peer))
}

async fn drive<S>(mut handshake: Handshake, conn: &mut S) -> Result<SecurityContext, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match handshake.next_step() {
            Step::Send(token) => send_token(conn, &token).await?,
            Step::Receive => {
                let token = receive_token(conn).await?;
                handshake.receive(&token)?;
            }
            Step::Complete => return handshake.into_context(),
        }
    }
}

/// Wrap `message` and write it as one frame. Any failure fails the context.
pub async fn wrap_and_send<S>(
    ctx: &mut SecurityContext,
    message: &[u8],
    conn: &mut S,
) -> Result<(), ChannelError>
where
    S: AsyncWrite + Unpin,
{
    let token = ctx.wrap(message)?;
    if let Err(e) = send_token(conn, &token).await {
        ctx.fail();
        return Err(e.into());
    }
    Ok(())
}

/// Read one frame and unwrap it.
///
/// [`ChannelError::Closed`] means the peer hung up cleanly,
/// [`ChannelError::Corrupt`] a broken frame, [`ChannelError::Unwrap`] a token
/// that failed decryption or integrity checks.
pub async fn receive_and_unwrap<S>(
    ctx: &mut SecurityContext,
    conn: &mut S,
) -> Result<Message, ChannelError>
where
    S: AsyncRead + Unpin,
{
    let token = receive_token(conn).await?;
    ctx.unwrap(&token)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::{ContextState, CredentialUsage, NoiseMechanism, verify_peer_match};

    const DEADLINE: Duration = Duration::from_secs(5);

    fn credentials(agent: &str, collector: &str) -> (Credential, Credential) {
        let a = Credential::generate(agent, CredentialUsage::Initiate, Duration::from_secs(60)).unwrap();
        let c = Credential::generate(collector, CredentialUsage::Accept, Duration::from_secs(60)).unwrap();
        let (ak, ck) = (a.public_key().to_vec(), c.public_key().to_vec());
        (a.with_trusted(collector, &ck), c.with_trusted(agent, &ak))
    }

    async fn establish(
        agent: Credential,
        collector: Credential,
        expected: &str,
    ) -> (
        Result<SecurityContext, AuthError>,
        Result<(SecurityContext, String), AuthError>,
        DuplexStream,
        DuplexStream,
    ) {
        let (mut a, mut b) = duplex(4096);
        let server = tokio::spawn(async move {
            let res = accept(&NoiseMechanism, &collector, &mut b, DEADLINE).await;
            (res, b)
        });
        let client = initiate(&NoiseMechanism, &agent, expected, &mut a, DEADLINE).await;
        let (server_res, b) = server.await.unwrap();
        (client, server_res, a, b)
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical() {
        let (agent, collector) = credentials("/O=G/CN=agent", "/O=G/CN=collector");
        let (client, server, mut a, mut b) = establish(agent, collector, "/O=G/CN=collector").await;
        let mut ctx_a = client.unwrap();
        let (mut ctx_b, peer) = server.unwrap();
        assert_eq!(peer, "/O=G/CN=agent");

        let payload = b"{\"type\":\"update\"}\0";
        wrap_and_send(&mut ctx_a, payload, &mut a).await.unwrap();
        let got = receive_and_unwrap(&mut ctx_b, &mut b).await.unwrap();
        assert_eq!(got.as_bytes(), payload);
        assert_eq!(got.as_text().unwrap(), "{\"type\":\"update\"}");

        wrap_and_send(&mut ctx_b, b"ack", &mut b).await.unwrap();
        assert_eq!(
            receive_and_unwrap(&mut ctx_a, &mut a).await.unwrap().as_bytes(),
            b"ack"
        );
    }

    #[tokio::test]
    async fn delegated_peer_matches_base_name() {
        let (agent, collector) = credentials("/CN=agent", "host/CN=proxy");
        let (client, server, _, _) = establish(agent, collector, "host").await;
        assert!(server.is_ok());
        assert_eq!(client.unwrap().peer_name(), "host/CN=proxy");
    }

    #[tokio::test]
    async fn mismatched_peer_fails_before_any_data() {
        let (agent, collector) = credentials("/CN=agent", "host/CN=proxy");
        let (client, server, a, mut b) = establish(agent, collector, "otherhost").await;
        assert!(matches!(client, Err(AuthError::PeerMismatch { .. })));

        let (mut ctx_b, _) = server.unwrap();
        drop(a);
        assert!(matches!(
            receive_and_unwrap(&mut ctx_b, &mut b).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn self_loopback_identity_is_verified() {
        let (agent, collector) = credentials("/CN=svc/CN=proxy", "/CN=svc");
        let (client, _, _, _) = establish(agent, collector, "/CN=svc").await;
        assert!(verify_peer_match(&client.unwrap()));
    }

    #[tokio::test]
    async fn tampered_token_fails_unwrap_and_context() {
        let (agent, collector) = credentials("/CN=agent", "/CN=collector");
        let (client, server, mut a, mut b) = establish(agent, collector, "/CN=collector").await;
        let mut ctx_a = client.unwrap();
        let (mut ctx_b, _) = server.unwrap();

        let mut token = ctx_a.wrap(b"secret").unwrap().to_vec();
        token[0] ^= 0xff;
        send_token(&mut a, &token).await.unwrap();

        assert!(matches!(
            receive_and_unwrap(&mut ctx_b, &mut b).await,
            Err(ChannelError::Unwrap(_))
        ));
        assert_eq!(ctx_b.state(), ContextState::Failed);
        assert!(matches!(ctx_b.wrap(b"x"), Err(ChannelError::Unusable(ContextState::Failed))));
    }

    #[tokio::test]
    async fn truncated_frame_is_corrupt() {
        let (agent, collector) = credentials("/CN=agent", "/CN=collector");
        let (_, server, mut a, mut b) = establish(agent, collector, "/CN=collector").await;
        let (mut ctx_b, _) = server.unwrap();

        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        assert!(matches!(
            receive_and_unwrap(&mut ctx_b, &mut b).await,
            Err(ChannelError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (agent, _) = credentials("/CN=agent", "/CN=collector");
        let (mut a, _b) = duplex(4096);
        let res = initiate(
            &NoiseMechanism,
            &agent,
            "/CN=collector",
            &mut a,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(res, Err(AuthError::Timeout(_))));
    }
}
