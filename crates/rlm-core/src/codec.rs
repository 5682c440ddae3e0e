//! Wire codec (§4.A): length-prefixed JSON framing for the sub-call socket.
//!
//! The HTTP framing side (isolated-env broker, §4.D) needs no extra codec —
//! it is plain `serde_json` bodies over `axum`/`reqwest` — so this module
//! only covers socket framing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RlmError};

/// Maximum frame size accepted on the socket. Guards against a misbehaving
/// peer claiming an enormous length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Write one length-prefixed JSON frame: a 4-byte big-endian length prefix
/// followed by the UTF-8 JSON document.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .map_err(|_| RlmError::Protocol("frame exceeds u32::MAX bytes".to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. A zero-byte or truncated read (the
/// peer closed the connection before sending a length prefix) is reported as
/// `Ok(None)` rather than an error, per spec's "empty/closed connection"
/// framing rule; the caller treats that as an empty-object response.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RlmError::Protocol(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_BYTES}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}
