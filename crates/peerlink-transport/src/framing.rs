//! Length-prefixed framing for direct sockets.
//!
//! Every frame on a direct socket (greeting, handshake and envelopes alike)
//! is preceded by its body length as a 4-octet little-endian integer.

use peerlink_core::{TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in octets
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest frame body accepted by default
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Prefix `body` with its length.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if the length does not fit the
/// prefix.
pub fn encode_frame(body: &[u8]) -> TransportResult<Vec<u8>> {
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge(body.len()))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] for a declared length above
/// `max_frame_size` and an I/O error if the stream ends mid-frame.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> TransportResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame body with its prefix and flush.
///
/// # Errors
///
/// Returns an I/O error from the underlying stream.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
