//! Length-prefixed JSON framing used on the control channel and for the
//! HTTP client-meta header (spec.md §6).
//!
//! Wire format: `[4-byte big-endian length][JSON payload]`. spec.md §6 notes
//! any concrete framing is acceptable as long as both ends agree; JSON over
//! this length prefix keeps the on-the-wire shape readable for debugging and
//! avoids pulling in a binary serde format for what is, at steady state, a
//! handful of small control messages per connection.

use crate::error::TunnelResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frames larger than this are rejected outright; nothing this protocol
/// sends legitimately approaches it.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value into a length-prefixed JSON frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a JSON payload (without length prefix) into a typed value.
pub fn json_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TunnelResult<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Write one length-prefixed JSON frame directly to an async writer.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> TunnelResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one length-prefixed JSON frame from an async reader.
///
/// Returns `Ok(None)` on clean EOF before any bytes of the next frame have
/// arrived; any other truncation is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> TunnelResult<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(crate::error::TunnelError::InvalidFrame(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(json_decode(&payload)?))
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
///
/// Used where frames arrive interleaved with other data on the same buffer
/// (the HTTP edge peeks a request off the wire this way before handing the
/// rest to the tunnel).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete JSON-decoded messages.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> TunnelResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if len > MAX_FRAME_SIZE {
                return Err(crate::error::TunnelError::InvalidFrame(format!(
                    "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let payload = &self.buffer[4..4 + len];
            let msg: T = json_decode(payload)?;
            messages.push(msg);

            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Number of bytes currently buffered and not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
