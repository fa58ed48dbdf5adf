//! Length-prefixed typed frames.
//!
//! ```text
//! +----------------+------+-------------------+
//! | length: u32 BE | type | payload (bincode) |
//! +----------------+------+-------------------+
//!                  |<------- length -------->|
//! ```
//!
//! `length` counts the type byte plus the payload. A declared length above the
//! reader's cap is not allocated; the read fails closed and yields no message.
//! Frames are read strictly in order, one at a time, per stream.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::messages;

pub const FRAME_HEADER_LEN: usize = 5;

/// Largest frame a reader accepts by default: 1 MiB payload plus headroom.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024 + 4096;

/// A message that carries its own frame type tag.
pub trait WireMessage: Serialize + DeserializeOwned {
    fn message_type(&self) -> u8;
}

#[derive(Debug)]
pub enum FrameError {
    Io(std::io::Error),
    TooLarge { declared: usize, max: usize },
    Empty,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "frame io: {e}"),
            FrameError::TooLarge { declared, max } => {
                write!(f, "declared frame length {declared} exceeds cap {max}")
            }
            FrameError::Empty => write!(f, "frame has no type byte"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<FrameError> for MeshError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(_) => MeshError::transient(e.to_string()),
            _ => MeshError::protocol(e.to_string()),
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, message_type: u8, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() + 1;
    let len = u32::try_from(len).map_err(|_| FrameError::TooLarge {
        declared: len,
        max: u32::MAX as usize,
    })?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&len.to_be_bytes());
    header[4] = message_type;

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on clean EOF before a header.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<(u8, Vec<u8>)>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let declared = u32::from_be_bytes(len_buf) as usize;
    if declared == 0 {
        return Err(FrameError::Empty);
    }
    if declared > max_len {
        return Err(FrameError::TooLarge {
            declared,
            max: max_len,
        });
    }

    let mut type_buf = [0u8; 1];
    reader.read_exact(&mut type_buf).await?;
    let mut payload = vec![0u8; declared - 1];
    reader.read_exact(&mut payload).await?;
    Ok(Some((type_buf[0], payload)))
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: WireMessage,
{
    let payload = messages::serialize(message)
        .map_err(|e| FrameError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    write_frame(writer, message.message_type(), &payload).await
}

/// Read one typed message. Oversized, truncated, undecodable or mistagged frames
/// all yield `None`; the caller drops the stream.
pub async fn read_message<R, T>(reader: &mut R, max_len: usize) -> Option<T>
where
    R: AsyncRead + Unpin,
    T: WireMessage,
{
    let (message_type, payload) = match read_frame(reader, max_len).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(FrameError::TooLarge { declared, max }) => {
            warn!(declared, max, "rejecting oversized frame");
            return None;
        }
        Err(e) => {
            debug!(error = %e, "frame read failed");
            return None;
        }
    };

    let message: T = match messages::deserialize_bounded(&payload) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, message_type, "undecodable frame payload");
            return None;
        }
    };
    if message.message_type() != message_type {
        debug!(
            declared = message_type,
            actual = message.message_type(),
            "frame type tag does not match payload"
        );
        return None;
    }
    Some(message)
}
