//! Length-prefixed framing codec (spec.md §4.A).
//!
//! Wire format: `u32` big-endian length prefix followed by that many
//! payload bytes. A prefix of zero denotes a keep-alive frame carrying no
//! envelope. Reads loop until the prefix and the full payload have
//! arrived; a clean peer shutdown mid-read surfaces as
//! [`TransportError::ConnectionClosed`].

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::TransportError;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A frame read off the wire: either a keep-alive (no bytes) or a payload
/// buffer holding exactly the envelope bytes.
pub enum Frame {
    KeepAlive,
    Payload(PooledBuffer),
}

fn io_to_transport(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(err)
    }
}

/// Read exactly one frame, validating the length prefix against
/// `max_packet_size`. `length == 0` yields [`Frame::KeepAlive`] without
/// touching the buffer pool.
pub async fn read_frame<R>(
    reader: &mut R,
    max_packet_size: u32,
    pool: &Arc<BufferPool>,
) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.map_err(io_to_transport)?;
    let length = u32::from_be_bytes(prefix);

    if length == 0 {
        return Ok(Frame::KeepAlive);
    }
    if length > i32::MAX as u32 {
        return Err(TransportError::NegativeLength);
    }
    if length > max_packet_size {
        return Err(TransportError::FrameTooLarge {
            len: length,
            max: max_packet_size,
        });
    }

    let mut buf = pool.acquire(length as usize);
    buf.as_mut_vec().resize(length as usize, 0);
    reader
        .read_exact(buf.as_mut_vec())
        .await
        .map_err(io_to_transport)?;
    Ok(Frame::Payload(buf))
}

/// Write exactly one frame as a single contiguous write (length prefix
/// immediately followed by the payload), then flush. Ordering across
/// writers on the same stream is the caller's responsibility (spec.md
/// §4.A: guaranteed by the per-connection send mutex).
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    writer.write_all(&framed).await.map_err(io_to_transport)?;
    writer.flush().await.map_err(io_to_transport)?;
    Ok(())
}

/// Write a zero-length keep-alive frame.
pub async fn write_keepalive<W>(writer: &mut W) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u32.to_be_bytes()).await.map_err(io_to_transport)?;
    writer.flush().await.map_err(io_to_transport)?;
    Ok(())
}
