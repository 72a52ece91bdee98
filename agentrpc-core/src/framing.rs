//! Length-prefixed framing for stream-socket transports.
//!
//! Wire format:
//!
//! ```text
//! [length:4 big-endian][payload:length]
//! ```
//!
//! A reader must read exactly `length` bytes; short reads are errors. Frames
//! larger than the configured ceiling are rejected before the payload is
//! allocated.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AgentError;

/// Frame header size (4-byte big-endian length).
pub const FRAME_HEADER_LEN: usize = 4;

/// Default ceiling on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Prefix a payload with its 4-byte big-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Write one complete frame.
///
/// The header and payload are written as a single buffer so the frame
/// reaches the wire atomically relative to other writers serialized on the
/// same connection.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<(), AgentError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len {
        return Err(AgentError::invalid_message(format!(
            "outgoing frame of {} bytes exceeds the {} byte ceiling",
            payload.len(),
            max_len
        )));
    }
    let frame = encode_frame(payload);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| AgentError::ConnectionFailed(format!("frame write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AgentError::ConnectionFailed(format!("frame flush failed: {e}")))?;
    Ok(())
}

/// Read the next complete frame payload.
///
/// Orderly close is modeled explicitly: EOF at a frame boundary yields
/// `CONNECTION_CLOSED`; EOF mid-header or mid-payload is a fault
/// (`CONNECTION_FAILED`). Frames above `max_len` are rejected with
/// `INVALID_MESSAGE`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Bytes, AgentError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(|e| AgentError::ConnectionFailed(format!("frame read failed: {e}")))?;
        if n == 0 {
            return if filled == 0 {
                Err(AgentError::ConnectionClosed)
            } else {
                Err(AgentError::ConnectionFailed(
                    "peer closed mid-frame header".into(),
                ))
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(AgentError::invalid_message(format!(
            "incoming frame of {len} bytes exceeds the {max_len} byte ceiling"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            AgentError::ConnectionFailed("peer closed mid-frame payload".into())
        } else {
            AgentError::ConnectionFailed(format!("frame read failed: {e}"))
        }
    })?;

    Ok(Bytes::from(payload))
}
