//! Length-prefixed token framing.
//!
//! Frame = `[u32 big-endian length][payload]`. The same framing carries the
//! clear-text handshake tokens and, afterwards, the wrapped application tokens.
//!
//! Two flavours share the format:
//! - [`send_token`] / [`receive_token`]: async helpers over any `AsyncRead`/`AsyncWrite`,
//!   used by the blocking-style drivers in [`crate::channel`].
//! - [`TokenCodec`]: incremental encoder/decoder over `BytesMut`, used by readiness
//!   loops that perform one non-blocking read or write at a time.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::FrameError;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;
/// Upper bound for one token; larger prefixes are treated as corruption.
pub const MAX_TOKEN_LEN: usize = 16 * 1024 * 1024;

/// Write one token. `write_all` retries short writes until done or the connection errors.
pub async fn send_token<W>(conn: &mut W, token: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if token.len() > MAX_TOKEN_LEN {
        return Err(FrameError::Oversized(token.len()));
    }
    let len = token.len() as u32;
    conn.write_all(&len.to_be_bytes()).await?;
    conn.write_all(token).await?;
    conn.flush().await?;
    Ok(())
}

/// Read one token.
///
/// Returns [`FrameError::Eof`] when the peer closed at a frame boundary and
/// [`FrameError::Truncated`] when it closed in the middle of a frame.
pub async fn receive_token<R>(conn: &mut R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let read = read_full(conn, &mut prefix).await?;
    if read == 0 {
        return Err(FrameError::Eof);
    }
    if read < LENGTH_PREFIX {
        return Err(FrameError::Truncated {
            read,
            expected: LENGTH_PREFIX,
        });
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_TOKEN_LEN {
        return Err(FrameError::Oversized(len));
    }

    let mut buf = vec![0u8; len];
    let read = read_full(conn, &mut buf).await?;
    if read < len {
        return Err(FrameError::Truncated {
            read,
            expected: len,
        });
    }
    Ok(Bytes::from(buf))
}

/// Fill `buf` unless the stream ends first; returns the number of bytes read.
async fn read_full<R>(conn: &mut R, buf: &mut [u8]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = conn.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Incremental codec for non-blocking I/O.
pub struct TokenCodec {
    inner: LengthDelimitedCodec,
}

impl TokenCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX)
            .big_endian()
            .max_frame_length(MAX_TOKEN_LEN)
            .new_codec();
        Self { inner }
    }

    /// Append one framed token to `dst`.
    pub fn encode(&mut self, token: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(FrameError::Oversized(token.len()));
        }
        self.inner.encode(token, dst)?;
        Ok(())
    }

    /// Pop the next complete token from `src`, if one is buffered.
    ///
    /// The inner codec is only consulted once a whole frame is buffered, so it
    /// never carries a half-read header between calls.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(len) = peek_len(src) else {
            return Ok(None);
        };
        if len > MAX_TOKEN_LEN {
            return Err(FrameError::Oversized(len));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }

    /// Classify end-of-stream given what is still buffered.
    pub fn on_eof(&self, src: &BytesMut) -> FrameError {
        match peek_len(src) {
            _ if src.is_empty() => FrameError::Eof,
            None => FrameError::Truncated {
                read: src.len(),
                expected: LENGTH_PREFIX,
            },
            Some(len) => FrameError::Truncated {
                read: src.len() - LENGTH_PREFIX,
                expected: len,
            },
        }
    }
}

fn peek_len(src: &BytesMut) -> Option<usize> {
    if src.len() < LENGTH_PREFIX {
        return None;
    }
    Some(u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize)
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::new()
    }
}
