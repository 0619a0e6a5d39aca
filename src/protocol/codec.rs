use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::core::Error;
use super::message::{Command, Frame};
use super::{ETX, FALLBACK_MIN_BUFFER, FALLBACK_MIN_FRAME, STX};

/// Codec for STX/ETX delimited scale frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(start) = src.iter().position(|&b| b == STX) else {
                return Ok(decode_unframed(src));
            };

            let Some(end) = src[start + 1..]
                .iter()
                .position(|&b| b == ETX)
                .map(|offset| start + 1 + offset)
            else {
                // Wait for the closing marker
                return Ok(None);
            };

            let consumed = src.split_to(end + 1);
            let text = String::from_utf8_lossy(&consumed[start + 1..end]).into_owned();
            if let Some(frame) = Frame::parse(text) {
                return Ok(Some(frame));
            }
        }
    }
}

/// Recovers a frame from a buffer with no start marker.
///
/// The first byte is a stray lead-in and the last three are trailing noise.
/// The buffer is cleared whether or not the middle is long enough to keep.
fn decode_unframed(src: &mut BytesMut) -> Option<Frame> {
    if src.len() <= FALLBACK_MIN_BUFFER {
        return None;
    }

    let body = &src[1..src.len() - 3];
    let frame = if body.len() >= FALLBACK_MIN_FRAME {
        Frame::parse(String::from_utf8_lossy(body).into_owned())
    } else {
        debug!(len = src.len(), "discarding unframed data");
        None
    };
    src.clear();
    frame
}

impl Encoder<Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

/// Accumulates datagram payloads and yields complete classified frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder
    pub fn new() -> Self {
        FrameDecoder {
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(crate::core::MAX_DATAGRAM_SIZE),
        }
    }

    /// Appends a chunk and returns every frame it completed, in order
    pub fn append(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "frame decode failed, dropping buffer");
                    self.buffer.clear();
                    break;
                }
            }
        }
        frames
    }

    /// Bytes waiting for a closing marker
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
