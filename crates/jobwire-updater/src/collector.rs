//! Receiving side of the update protocol.
//!
//! Accepts agents, authenticates them and forwards every update to a channel,
//! acknowledging each one once it has been handed over.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use jobwire_model::{Envelope, JobUpdate};
use jobwire_secure::{ChannelError, Credential, Mechanism, NoiseMechanism, channel, names_match};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::CollectorError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// One update as delivered by an agent.
#[derive(Debug, Clone)]
pub struct Received {
    /// 1-based index of the accepted connection it arrived on.
    pub connection: u64,
    /// Verified agent identity.
    pub peer: String,
    pub update: JobUpdate,
}

#[derive(Clone)]
struct Session {
    credential: Arc<Credential>,
    mechanism: Arc<dyn Mechanism>,
    expected_peer: Option<String>,
    handshake_timeout: Duration,
}

pub struct Collector {
    listener: TcpListener,
    session: Session,
    disconnect_after: Option<usize>,
}

impl Collector {
    pub async fn bind(addr: &str, credential: Credential) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            session: Session {
                credential: Arc::new(credential),
                mechanism: Arc::new(NoiseMechanism),
                expected_peer: None,
                handshake_timeout: HANDSHAKE_TIMEOUT,
            },
            disconnect_after: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Only accept agents whose identity matches `peer` (proxy suffixes allowed).
    pub fn with_expected_peer(mut self, peer: impl Into<String>) -> Self {
        self.session.expected_peer = Some(peer.into());
        self
    }

    pub fn with_mechanism(mut self, mechanism: Arc<dyn Mechanism>) -> Self {
        self.session.mechanism = mechanism;
        self
    }

    /// Drop the first connection, without acknowledging, when its `n + 1`-th update arrives.
    pub fn disconnect_after(mut self, n: usize) -> Self {
        self.disconnect_after = Some(n);
        self
    }

    /// Accept connections until `cancel` fires. Each connection is served on its own task.
    pub async fn serve(
        self,
        tx: mpsc::Sender<Received>,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let mut connection = 0u64;
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };
            connection += 1;
            debug!(%addr, connection, "agent connected");

            let limit = if connection == 1 { self.disconnect_after } else { None };
            let session = self.session.clone();
            let tx = tx.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                match session.run(stream, connection, limit, tx, cancel).await {
                    Ok(()) => debug!(connection, "agent session ended"),
                    Err(e) => warn!(connection, error = %e, "agent session failed"),
                }
            });
        }
    }
}

impl Session {
    async fn run(
        self,
        mut stream: TcpStream,
        connection: u64,
        limit: Option<usize>,
        tx: mpsc::Sender<Received>,
        cancel: CancellationToken,
    ) -> Result<(), CollectorError> {
        let (mut ctx, peer) = channel::accept(
            self.mechanism.as_ref(),
            &self.credential,
            &mut stream,
            self.handshake_timeout,
        )
        .await?;
        if let Some(expected) = &self.expected_peer {
            if !names_match(&peer, expected) {
                return Err(CollectorError::Rejected { peer });
            }
        }
        info!(connection, %peer, "agent authenticated");

        let mut received = 0usize;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = channel::receive_and_unwrap(&mut ctx, &mut stream) => message,
            };
            let message = match message {
                Err(ChannelError::Closed) => return Ok(()),
                other => other?,
            };

            match Envelope::from_bytes(message.as_bytes())? {
                Envelope::Update(update) => {
                    received += 1;
                    if limit.is_some_and(|n| received > n) {
                        debug!(connection, "dropping connection before acknowledging");
                        return Ok(());
                    }
                    let seq = update.seq;
                    let item = Received {
                        connection,
                        peer: peer.clone(),
                        update,
                    };
                    if tx.send(item).await.is_err() {
                        return Ok(());
                    }
                    let ack = Envelope::Ack { seq }.to_bytes()?;
                    channel::wrap_and_send(&mut ctx, &ack, &mut stream).await?;
                }
                Envelope::Ack { seq } => {
                    warn!(connection, seq, "agent sent an acknowledgement; ignored");
                }
            }
        }
    }
}
