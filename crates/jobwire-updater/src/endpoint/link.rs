//! Non-blocking connection driving for one endpoint.
//!
//! Every call performs a bounded amount of work: at most one socket read and
//! one socket write, plus whatever whole frames those produced.

use std::{
    io, mem,
    net::SocketAddr,
    time::{Instant, SystemTime},
};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use jobwire_core::UpdaterConfig;
use jobwire_model::{Envelope, WireError};
use jobwire_secure::{
    AuthError, ChannelError, Credential, FrameError, Handshake, Mechanism, SecurityContext, Step,
    framer::TokenCodec, names_match, verify_peer_match,
};
use tokio::{
    io::{Interest, Ready},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, trace, warn};

use super::{Endpoint, Failure, Outbound, Progress};

const READ_CHUNK: usize = 8 * 1024;

/// Shared inputs for driving any endpoint.
pub(crate) struct LinkCtx<'a> {
    pub mechanism: &'a dyn Mechanism,
    pub credential: &'a Credential,
    pub config: &'a UpdaterConfig,
}

/// What woke an endpoint.
pub(crate) enum Wake {
    Connected(io::Result<TcpStream>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Ready(io::Result<Ready>),
}

pub(super) enum Link {
    Idle,
    Connecting {
        connect: BoxFuture<'static, io::Result<TcpStream>>,
        deadline: Instant,
    },
    Handshaking {
        conn: Conn,
        handshake: Handshake,
        deadline: Instant,
    },
    Established {
        conn: Conn,
        ctx: SecurityContext,
    },
}

pub(super) struct Conn {
    stream: TcpStream,
    codec: TokenCodec,
    rbuf: BytesMut,
    wbuf: BytesMut,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            codec: TokenCodec::new(),
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::new(),
        }
    }

    fn interest(&self, want_write: bool) -> Interest {
        if want_write || !self.wbuf.is_empty() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    /// One non-blocking read. End of stream is reported as an error.
    fn read_once(&mut self) -> Result<(), FrameError> {
        self.rbuf.reserve(READ_CHUNK);
        match self.stream.try_read_buf(&mut self.rbuf) {
            Ok(0) => Err(self.codec.on_eof(&self.rbuf)),
            Ok(n) => {
                trace!(bytes = n, "read");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(FrameError::Io(e)),
        }
    }

    /// One non-blocking write of whatever is buffered.
    fn write_once(&mut self) -> io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        match self.stream.try_write(&self.wbuf) {
            Ok(n) => {
                self.wbuf.advance(n);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn next_token(&mut self) -> Result<Option<Bytes>, FrameError> {
        self.codec.decode(&mut self.rbuf)
    }

    fn push_token(&mut self, token: Bytes) -> Result<(), FrameError> {
        self.codec.encode(token, &mut self.wbuf)
    }
}

/// Queue every token the handshake wants sent. Returns `true` once it is complete.
fn pump(conn: &mut Conn, handshake: &mut Handshake) -> Result<bool, AuthError> {
    loop {
        match handshake.next_step() {
            Step::Send(token) => conn.push_token(Bytes::from(token))?,
            Step::Receive => return Ok(false),
            Step::Complete => return Ok(true),
        }
    }
}

impl From<AuthError> for Failure {
    fn from(e: AuthError) -> Self {
        Failure {
            clean: e.is_clean_close(),
            credential: matches!(e, AuthError::Credential(_)),
            ..Failure::new(e.to_string())
        }
    }
}

impl From<FrameError> for Failure {
    fn from(e: FrameError) -> Self {
        Failure {
            clean: matches!(e, FrameError::Eof),
            ..Failure::new(e.to_string())
        }
    }
}

impl From<io::Error> for Failure {
    fn from(e: io::Error) -> Self {
        Failure::new(e.to_string())
    }
}

impl From<ChannelError> for Failure {
    fn from(e: ChannelError) -> Self {
        Failure {
            clean: e.is_clean_close(),
            ..Failure::new(e.to_string())
        }
    }
}

impl From<WireError> for Failure {
    fn from(e: WireError) -> Self {
        Failure::new(e.to_string())
    }
}

fn bind(address: &str) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

fn push_ack(conn: &mut Conn, sec: &mut SecurityContext, seq: u64) -> Result<(), Failure> {
    let bytes = Envelope::Ack { seq }.to_bytes()?;
    conn.push_token(sec.wrap(&bytes)?)?;
    conn.write_once()?;
    Ok(())
}

impl Endpoint {
    /// Begin connecting. The endpoint must be idle.
    pub fn start_connect(&mut self, timeout: std::time::Duration) {
        let address = self.config.address.clone();
        debug!(endpoint = %self.config.name, %address, "connecting");
        self.link = Link::Connecting {
            connect: Box::pin(async move { TcpStream::connect(address).await }),
            deadline: Instant::now() + timeout,
        };
    }

    /// Bind the acceptor's listening socket.
    pub fn start_listen(&mut self, config: &UpdaterConfig, out: &mut Vec<Progress>) {
        match bind(&self.config.address) {
            Ok((listener, address)) => {
                info!(endpoint = %self.config.name, %address, "listening for peer updaters");
                self.listener = Some(listener);
                self.listening = Some(address);
                out.push(Progress::Listening { address });
            }
            Err(e) => {
                let failure = Failure::new(format!("bind {} failed: {e}", self.config.address));
                out.push(Progress::Failed(self.fail(failure, config)));
            }
        }
    }

    /// Resolve once the endpoint has something to do.
    ///
    /// Idle initiators never resolve; the engine wakes them through their
    /// deadline. Idle acceptors wait for the next peer.
    pub async fn wait(&mut self) -> Wake {
        let want_send = self.can_send();
        match &mut self.link {
            Link::Idle => match &self.listener {
                Some(listener) => Wake::Accepted(listener.accept().await),
                None => std::future::pending().await,
            },
            Link::Connecting { connect, .. } => Wake::Connected(connect.await),
            Link::Handshaking { conn, .. } => {
                Wake::Ready(conn.stream.ready(conn.interest(false)).await)
            }
            Link::Established { conn, .. } => {
                Wake::Ready(conn.stream.ready(conn.interest(want_send)).await)
            }
        }
    }

    /// Tear the link down if its connect or handshake deadline has passed.
    pub fn check_deadline(&mut self, now: Instant, ctx: &LinkCtx<'_>, out: &mut Vec<Progress>) {
        let failure = match &self.link {
            Link::Connecting { deadline, .. } if *deadline <= now => {
                Failure::new(format!("connect did not complete within {:?}", ctx.config.connect_timeout()))
            }
            Link::Handshaking { deadline, .. } if *deadline <= now => {
                AuthError::Timeout(ctx.config.handshake_timeout()).into()
            }
            _ => return,
        };
        out.push(Progress::Failed(self.teardown(failure, ctx.config)));
    }

    /// Drive the endpoint after `wake`.
    pub fn handle(&mut self, wake: Wake, ctx: &LinkCtx<'_>, out: &mut Vec<Progress>) {
        let result = match wake {
            Wake::Connected(Ok(stream)) => self.on_connected(stream, ctx),
            Wake::Connected(Err(e)) => Err(Failure::new(format!("connect failed: {e}"))),
            Wake::Accepted(Ok((stream, addr))) => self.on_accepted(stream, addr, ctx),
            Wake::Accepted(Err(e)) => {
                self.listener = None;
                Err(Failure::new(format!("accept failed: {e}")))
            }
            Wake::Ready(Ok(ready)) => self.on_ready(ready, out),
            Wake::Ready(Err(e)) => Err(e.into()),
        };
        if let Err(failure) = result {
            if failure.clean {
                debug!(endpoint = %self.config.name, "peer closed the connection");
            }
            out.push(Progress::Failed(self.teardown(failure, ctx.config)));
        }
    }

    /// Acknowledge an inbound update through `seq` once it has been applied.
    /// A vanished connection is left alone; the peer re-sends on reconnect.
    pub fn confirm(&mut self, seq: u64, config: &UpdaterConfig, out: &mut Vec<Progress>) {
        let result = match &mut self.link {
            Link::Established { conn, ctx } => push_ack(conn, ctx, seq),
            _ => return,
        };
        if let Err(failure) = result {
            out.push(Progress::Failed(self.teardown(failure, config)));
        }
    }

    /// Drop the inbound connection without acknowledging what is pending on it.
    pub fn refuse(&mut self, reason: String, config: &UpdaterConfig, out: &mut Vec<Progress>) {
        if !matches!(self.link, Link::Idle) {
            out.push(Progress::Failed(self.teardown(Failure::new(reason), config)));
        }
    }

    /// Inbound connections of a listening acceptor close without touching the
    /// failure counters; anything else fails the endpoint.
    fn teardown(&mut self, failure: Failure, config: &UpdaterConfig) -> Failure {
        if self.is_acceptor() && self.listener.is_some() {
            self.link = Link::Idle;
            if !failure.clean {
                self.last_error = Some(failure.reason.clone());
            }
            return failure;
        }
        self.fail(failure, config)
    }

    fn on_accepted(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        ctx: &LinkCtx<'_>,
    ) -> Result<(), Failure> {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(endpoint = %self.config.name, error = %e, "set_nodelay failed");
        }
        let mut handshake = Handshake::accept(ctx.mechanism, ctx.credential)?;
        let mut conn = Conn::new(stream);
        pump(&mut conn, &mut handshake)?;
        conn.write_once()?;

        debug!(endpoint = %self.config.name, %addr, "peer connected; authenticating");
        self.link = Link::Handshaking {
            conn,
            handshake,
            deadline: Instant::now() + ctx.config.handshake_timeout(),
        };
        Ok(())
    }

    fn on_connected(&mut self, stream: TcpStream, ctx: &LinkCtx<'_>) -> Result<(), Failure> {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(endpoint = %self.config.name, error = %e, "set_nodelay failed");
        }
        let target = self
            .config
            .peer_name
            .as_deref()
            .unwrap_or(ctx.credential.principal());
        let mut handshake = Handshake::initiate(ctx.mechanism, ctx.credential, target)?;
        let mut conn = Conn::new(stream);
        pump(&mut conn, &mut handshake)?;
        conn.write_once()?;

        debug!(endpoint = %self.config.name, "connected; authenticating");
        self.link = Link::Handshaking {
            conn,
            handshake,
            deadline: Instant::now() + ctx.config.handshake_timeout(),
        };
        Ok(())
    }

    fn on_ready(&mut self, ready: Ready, out: &mut Vec<Progress>) -> Result<(), Failure> {
        match mem::replace(&mut self.link, Link::Idle) {
            Link::Handshaking {
                conn,
                handshake,
                deadline,
            } => self.step_handshake(conn, handshake, deadline, ready, out),
            Link::Established { conn, ctx: sec } => self.step_established(conn, sec, ready, out),
            other => {
                self.link = other;
                Ok(())
            }
        }
    }

    fn step_handshake(
        &mut self,
        mut conn: Conn,
        mut handshake: Handshake,
        deadline: Instant,
        ready: Ready,
        out: &mut Vec<Progress>,
    ) -> Result<(), Failure> {
        if ready.is_readable() || ready.is_read_closed() {
            conn.read_once().map_err(AuthError::from)?;
            while let Some(token) = conn.next_token().map_err(AuthError::from)? {
                handshake.receive(&token)?;
                if pump(&mut conn, &mut handshake)? {
                    let sec = handshake.into_context()?;
                    self.verify_peer(&sec)?;
                    conn.write_once()?;

                    let peer = sec.peer_name().to_string();
                    debug!(endpoint = %self.config.name, %peer, "security context established");
                    self.on_established();
                    out.push(Progress::Established { peer });
                    self.link = Link::Established { conn, ctx: sec };
                    return Ok(());
                }
            }
        }
        if ready.is_writable() {
            conn.write_once()?;
        }
        self.link = Link::Handshaking {
            conn,
            handshake,
            deadline,
        };
        Ok(())
    }

    fn verify_peer(&self, sec: &SecurityContext) -> Result<(), AuthError> {
        let matched = match &self.config.peer_name {
            Some(expected) => names_match(sec.peer_name(), expected),
            None => verify_peer_match(sec),
        };
        if matched {
            return Ok(());
        }
        let expected = self
            .config
            .peer_name
            .clone()
            .unwrap_or_else(|| sec.local_name().to_string());
        warn!(
            endpoint = %self.config.name,
            %expected,
            actual = sec.peer_name(),
            "peer identity mismatch"
        );
        Err(AuthError::PeerMismatch {
            expected,
            actual: sec.peer_name().to_string(),
        })
    }

    fn step_established(
        &mut self,
        mut conn: Conn,
        mut sec: SecurityContext,
        ready: Ready,
        out: &mut Vec<Progress>,
    ) -> Result<(), Failure> {
        if ready.is_readable() || ready.is_read_closed() {
            conn.read_once()?;
            let mut acked = Vec::new();
            while let Some(token) = conn.next_token()? {
                let message = sec.unwrap(&token)?;
                match Envelope::from_bytes(message.as_bytes())? {
                    Envelope::Ack { seq } if !self.is_acceptor() => {
                        self.ack_through(seq, &mut acked)
                    }
                    Envelope::Ack { seq } => {
                        warn!(endpoint = %self.config.name, seq, "peer sent an acknowledgement; ignored");
                    }
                    Envelope::Update(update) if self.is_acceptor() => {
                        trace!(endpoint = %self.config.name, job = %update.job_id, seq = update.seq, "update received");
                        out.push(Progress::Received {
                            update,
                            peer: sec.peer_name().to_string(),
                        });
                    }
                    Envelope::Update(update) => {
                        warn!(endpoint = %self.config.name, job = %update.job_id, "collector sent an update; ignored");
                    }
                }
            }
            if !acked.is_empty() {
                self.last_success = Some(SystemTime::now());
                out.push(Progress::Acked(acked));
            }
        }

        if ready.is_writable() {
            if conn.wbuf.is_empty() {
                self.finish_in_flight();
            }
            if conn.wbuf.is_empty() && self.can_send() {
                self.prepare_next(&mut conn, &mut sec, out)?;
            }
            conn.write_once()?;
            if conn.wbuf.is_empty() {
                self.finish_in_flight();
            }
        }

        self.link = Link::Established { conn, ctx: sec };
        Ok(())
    }

    /// Move the head of the queue into flight and buffer its wrapped frame.
    fn prepare_next(
        &mut self,
        conn: &mut Conn,
        sec: &mut SecurityContext,
        out: &mut Vec<Progress>,
    ) -> Result<(), Failure> {
        let Some(mut update) = self.queue.pop_front() else {
            return Ok(());
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        update.seq = seq;
        let (job_id, state) = (update.job_id.clone(), update.state);
        let bytes = Envelope::Update(update.clone()).to_bytes();
        self.in_flight = Some(Outbound { seq, update });

        let token = sec.wrap(&bytes?)?;
        conn.push_token(token)?;
        trace!(endpoint = %self.config.name, job = %job_id, seq, "update buffered");
        out.push(Progress::Sent { job_id, state, seq });
        Ok(())
    }

    fn finish_in_flight(&mut self) {
        if let Some(o) = self.in_flight.take() {
            self.unacked.push_back(o);
        }
    }
}
