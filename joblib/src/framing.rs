//! Length prefixed framing: a 4 byte big-endian payload length followed by exactly that many
//! payload bytes. Reads may arrive in arbitrarily small pieces.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

pub const LENGTH_PREFIX_LEN: usize = 4;
// the declared length is untrusted, so the buffer grows as bytes arrive instead of up front
const MAX_RESERVE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    AwaitingLength,
    AwaitingPayload { len: usize },
}

/// Decoder state machine for one connection, plus the matching encoder.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            state: DecodeState::AwaitingLength,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame has been started but not finished.
    pub fn is_mid_frame(&self, buffered: &BytesMut) -> bool {
        !buffered.is_empty() || self.state != DecodeState::AwaitingLength
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingLength => {
                    if src.len() < LENGTH_PREFIX_LEN {
                        src.reserve(LENGTH_PREFIX_LEN - src.len());
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    self.state = DecodeState::AwaitingPayload { len };
                }
                DecodeState::AwaitingPayload { len } => {
                    if src.len() < len {
                        src.reserve((len - src.len()).min(MAX_RESERVE));
                        return Ok(None);
                    }
                    self.state = DecodeState::AwaitingLength;
                    return Ok(Some(src.split_to(len).freeze()));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        // a frame cut short by EOF is dropped, never handed out partially
        let frame = self.decode(src)?;
        if frame.is_none() && self.is_mid_frame(src) {
            src.clear();
            self.state = DecodeState::AwaitingLength;
        }
        Ok(frame)
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = payload.as_ref();
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload of {} bytes does not fit the length prefix", payload.len()),
            )
        })?;
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32(len);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Encode one payload as a complete frame.
pub fn encode(payload: &[u8]) -> io::Result<Bytes> {
    let mut dst = BytesMut::new();
    FrameCodec::new().encode(payload, &mut dst)?;
    Ok(dst.freeze())
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` means the peer closed the stream before a whole frame arrived.
pub async fn read_frame<R>(reader: R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    FramedRead::new(reader, FrameCodec::new()).next().await.transpose()
}
