//! Frame codec for the local socket.
//!
//! Every frame is `[kind: u8][len: u32 big-endian][body: len bytes]`.
//!
//! | kind | frame      | body                       |
//! |------|------------|----------------------------|
//! | 1    | `Register` | empty                      |
//! | 2    | `Ack`      | one byte, `0` or `1`       |
//! | 3    | `Event`    | compact UTF-8 JSON record  |

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body accepted on either side.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const KIND_REGISTER: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_EVENT: u8 = 3;

/// One message on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Peer asks to become the active receiver.
    Register,
    /// Service's reply to `Register`.
    Ack(bool),
    /// One serialized event record.
    Event(Vec<u8>),
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Self::Register => KIND_REGISTER,
            Self::Ack(_) => KIND_ACK,
            Self::Event(_) => KIND_EVENT,
        }
    }
}

/// Errors reading or writing frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("frame body of {0} bytes exceeds limit of {MAX_FRAME_LEN}")]
    TooLarge(usize),

    #[error("malformed ack body")]
    InvalidAck,
}

/// Reads one frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Fails on I/O errors, truncated frames, and bodies that do not fit the
/// frame kind.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let kind = match reader.read_u8().await {
        Ok(kind) => kind,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    match kind {
        KIND_REGISTER => Ok(Some(Frame::Register)),
        KIND_ACK => match body.as_slice() {
            [0] => Ok(Some(Frame::Ack(false))),
            [1] => Ok(Some(Frame::Ack(true))),
            _ => Err(FrameError::InvalidAck),
        },
        KIND_EVENT => Ok(Some(Frame::Event(body))),
        other => Err(FrameError::UnknownKind(other)),
    }
}

/// Writes and flushes one frame.
///
/// # Errors
///
/// Fails on I/O errors or if the body exceeds [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let ack;
    let body: &[u8] = match frame {
        Frame::Register => &[],
        Frame::Ack(accepted) => {
            ack = [u8::from(*accepted)];
            &ack
        }
        Frame::Event(body) => body,
    };
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(5 + body.len());
    buf.push(frame.kind());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
