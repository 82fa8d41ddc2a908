// Frame codec - length-prefixed postcard frames
//
// Wire layout: u32 big-endian payload length, then the postcard payload.

use super::TransportError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a message into a complete frame
pub fn encode_frame<T: Serialize>(message: &T, max_len: usize) -> Result<Vec<u8>, TransportError> {
    let payload = postcard::to_allocvec(message).map_err(|e| TransportError::Codec(e.to_string()))?;
    if payload.len() > max_len {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame and flush; returns bytes written
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_len: usize) -> Result<usize, TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = encode_frame(message, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

/// Read one frame and decode it
///
/// An oversized length prefix is rejected before any payload is buffered.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| TransportError::Codec(e.to_string()))
}
