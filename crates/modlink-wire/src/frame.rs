//! Length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian payload length, one flag byte and the
//! payload. Flag bit 0 says more frames of the same message follow. A
//! zero-length single frame is a peer probe, not data.

use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Flag bit: another frame of this message follows.
pub const FLAG_MORE: u8 = 0x01;

/// Length prefix plus flag byte.
pub const HEADER_LEN: usize = 5;

/// One frame as read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub more: bool,
}

/// Encode a frame into a fresh buffer.
pub fn encode_frame(payload: &[u8], more: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(if more { FLAG_MORE } else { 0 });
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a multipart message into one contiguous buffer.
pub fn encode_frames(parts: &[&[u8]]) -> Bytes {
    let total: usize = parts.iter().map(|p| HEADER_LEN + p.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for (i, part) in parts.iter().enumerate() {
        let more = i + 1 < parts.len();
        buf.put_u32(part.len() as u32);
        buf.put_u8(if more { FLAG_MORE } else { 0 });
        buf.put_slice(part);
    }
    buf.freeze()
}

/// Decode the header into `(payload length, more)`.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u32, bool), WireError> {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let flags = header[4];
    if flags & !FLAG_MORE != 0 {
        return Err(WireError::Protocol(format!("unknown frame flags 0x{flags:02x}")));
    }
    Ok((len, flags & FLAG_MORE != 0))
}

/// Read one frame. Returns `None` when the stream ends between frames.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> Result<Option<Frame>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let (len, more) = decode_header(&header)?;
    if len > max {
        return Err(WireError::FrameTooLarge {
            size: len as usize,
            max,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(Frame {
        payload: Bytes::from(body),
        more,
    }))
}

/// Write pre-encoded frame bytes and flush.
pub async fn write_frames<W>(writer: &mut W, frames: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frames).await?;
    writer.flush().await?;
    Ok(())
}

/// Result of feeding one frame to a [`FrameAssembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    /// A zero-length single frame.
    Probe,
    /// Part of a multipart message; more frames are expected.
    Pending,
    /// A complete message payload.
    Complete(Bytes),
}

/// Joins multipart frames into one payload. Single frames pass through
/// without copying.
#[derive(Debug)]
pub struct FrameAssembler {
    partial: Option<BytesMut>,
    max: usize,
}

impl FrameAssembler {
    /// `max` bounds the size of a reassembled message.
    pub fn new(max: usize) -> Self {
        Self { partial: None, max }
    }

    pub fn push(&mut self, frame: Frame) -> Result<Assembled, WireError> {
        let Some(mut acc) = self.partial.take() else {
            return Ok(match (frame.more, frame.payload.is_empty()) {
                (false, true) => Assembled::Probe,
                (false, false) => Assembled::Complete(frame.payload),
                (true, _) => {
                    self.partial = Some(BytesMut::from(&frame.payload[..]));
                    Assembled::Pending
                }
            });
        };

        if acc.len() + frame.payload.len() > self.max {
            return Err(WireError::FrameTooLarge {
                size: acc.len() + frame.payload.len(),
                max: u32::try_from(self.max).unwrap_or(u32::MAX),
            });
        }
        acc.extend_from_slice(&frame.payload);
        if frame.more {
            self.partial = Some(acc);
            Ok(Assembled::Pending)
        } else {
            Ok(Assembled::Complete(acc.freeze()))
        }
    }

    pub fn is_pending(&self) -> bool {
        self.partial.is_some()
    }
}
