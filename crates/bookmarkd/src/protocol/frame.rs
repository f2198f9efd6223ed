use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    TooLarge { len: u64, max: u64 },
}

/// Read one frame: 4-byte little-endian length, then that many bytes
///
/// Returns `Ok(None)` when the peer closes cleanly between frames; a close
/// inside the length prefix is an `UnexpectedEof` error. A length above
/// `max_len` is rejected before anything is allocated.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {filled} of 4 length bytes"),
                )));
            }
            n => filled += n,
        }
    }
    let len = u32::from_le_bytes(prefix);
    if len > max_len {
        return Err(FrameError::TooLarge {
            len: len as u64,
            max: max_len as u64,
        });
    }

    let mut buf = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len() as u64,
        max: u32::MAX as u64,
    })?;

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
