//! Length-prefixed frame codec (§4.6): 4-byte big-endian payload length,
//! then that many bytes of UTF-8 JSON. Nothing upstream of this module
//! ever sees a partial frame.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 10 MiB body cap plus 64 KiB of headroom for JSON wrapping overhead.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024 + 64 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversize(usize),
}

/// Read one frame. Returns `Ok(None)` on a clean EOF with no bytes read
/// (the peer closed the connection between frames); any other failure to
/// fill the length prefix is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, FramingError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FramingError::Oversize(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FramingError::Oversize(payload.len()));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let frame = read_frame(&mut cursor).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_on_write() {
        let mut buf = Vec::new();
        let oversized = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = write_frame(&mut buf, &oversized).await.unwrap_err();
        assert!(matches!(err, FramingError::Oversize(_)));
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_rejected_on_read() {
        let mut buf = Vec::new();
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        buf.extend_from_slice(&len);
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::Oversize(_)));
    }
}
