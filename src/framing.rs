// src/framing.rs
//
// Length-prefixed message transport shared by the ingestion server and the
// gossip node. Wire format: 4-byte big-endian unsigned length N, then exactly
// N payload bytes.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single framed message (50 MiB). Declared lengths above this
/// are rejected before any allocation happens.
pub const MAX_MESSAGE_SIZE: u32 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message size {len} exceeds maximum {MAX_MESSAGE_SIZE}")]
    Oversize { len: u64 },
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    fn from_read(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
            _ => FrameError::Io(err),
        }
    }
}

/// Read one framed message. The caller is responsible for wrapping the call
/// in a deadline; on expiry the connection should be closed.
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.map_err(FrameError::from_read)?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::Oversize { len: len as u64 });
    }

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await.map_err(FrameError::from_read)?;
    Ok(buf)
}

/// Write one framed message: length prefix then body. A partial write leaves
/// the connection unusable; callers must drop it on error.
pub async fn write_frame<W>(w: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > u32::MAX as usize {
        return Err(FrameError::Oversize { len: data.len() as u64 });
    }
    let len = data.len() as u32;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::Oversize { len: len as u64 });
    }

    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_recovers_payload() {
        let mut out = std::io::Cursor::new(Vec::new());
        write_frame(&mut out, b"hello").await.unwrap();
        let buf = out.into_inner();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let got = read_frame(&mut cursor).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn roundtrip_empty_payload() {
        let mut out = std::io::Cursor::new(Vec::new());
        write_frame(&mut out, b"").await.unwrap();
        let mut cursor = std::io::Cursor::new(out.into_inner());
        let got = read_frame(&mut cursor).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn oversize_declared_length_rejected_before_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        // No body on purpose: the length check must fire first.
        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor).await {
            Err(FrameError::Oversize { len }) => {
                assert_eq!(len, MAX_MESSAGE_SIZE as u64 + 1)
            }
            other => panic!("expected Oversize, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversize_write_sends_nothing() {
        let data = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let mut out = std::io::Cursor::new(Vec::new());
        assert!(matches!(
            write_frame(&mut out, &data).await,
            Err(FrameError::Oversize { .. })
        ));
        assert!(out.into_inner().is_empty());
    }

    #[tokio::test]
    async fn short_body_is_truncated() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc"); // 3 of 10 promised bytes
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn short_length_prefix_is_truncated() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0u8]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Truncated)
        ));
    }
}
