//! Multipart message framing over byte streams.
//!
//! A multipart message is a frame count followed by length-prefixed frames,
//! all integers 4-byte big-endian:
//!
//! ```text
//! +-------------+-----------+---------+-----------+---------+-----+
//! | count (4 BE)| len0 (4BE)| frame 0 | len1 (4BE)| frame 1 | ... |
//! +-------------+-----------+---------+-----------+---------+-----+
//! ```
//!
//! Frames may be empty (the routing delimiter is), messages may not.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::Frames;
use crate::{MAX_FRAMES, MAX_MESSAGE_SIZE};

const PREFIX_LEN: usize = 4;

/// Codec turning a byte stream into multipart [`Frames`] and back.
///
/// Use with `FramedRead`/`FramedWrite` from `tokio_util::codec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCodec;

impl MultipartCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self
    }

    fn check_count(count: usize) -> ProtocolResult<()> {
        if count == 0 {
            return Err(ProtocolError::EmptyMessage);
        }
        if count > MAX_FRAMES {
            return Err(ProtocolError::TooManyFrames {
                count,
                max: MAX_FRAMES,
            });
        }
        Ok(())
    }

    fn check_size(size: usize) -> ProtocolResult<()> {
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

fn read_u32(src: &[u8], offset: usize) -> Option<usize> {
    let bytes: [u8; PREFIX_LEN] = src.get(offset..offset + PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

impl Decoder for MultipartCodec {
    type Item = Frames;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(count) = read_u32(src, 0) else {
            return Ok(None);
        };
        Self::check_count(count)?;

        // Walk the length prefixes without consuming until the whole message
        // is buffered.
        let mut offset = PREFIX_LEN;
        let mut payload = 0usize;
        for _ in 0..count {
            let Some(len) = read_u32(src, offset) else {
                src.reserve(offset + PREFIX_LEN - src.len());
                return Ok(None);
            };
            payload += len;
            Self::check_size(payload)?;

            offset += PREFIX_LEN + len;
            if src.len() < offset {
                src.reserve(offset - src.len());
                return Ok(None);
            }
        }

        let mut message = src.split_to(offset);
        message.advance(PREFIX_LEN);

        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = message.get_u32() as usize;
            frames.push(message.split_to(len).freeze());
        }

        tracing::trace!(frames = count, payload_bytes = payload, "Decoded multipart message");
        Ok(Some(frames))
    }
}

impl Encoder<Frames> for MultipartCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frames, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::check_count(item.len())?;
        let payload: usize = item.iter().map(|frame| frame.len()).sum();
        Self::check_size(payload)?;

        dst.reserve(PREFIX_LEN * (item.len() + 1) + payload);
        dst.put_u32(item.len() as u32);
        for frame in &item {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(frame);
        }

        tracing::trace!(frames = item.len(), payload_bytes = payload, "Encoded multipart message");
        Ok(())
    }
}
