use bytes::{Buf, BufMut, BytesMut};
use callwire_core::{decode_message, encode_message, Message};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for one frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

const MAX_ENCODABLE: usize = u32::MAX as usize;

/// Length-prefixed message codec: a 4-byte big-endian body length followed
/// by the JSON-encoded [`Message`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum frame size to prevent unbounded buffering
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Limits above what the 4-byte length prefix can express are lowered
    /// to `u32::MAX`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_ENCODABLE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(frame_len));
        }

        if src.len() < LENGTH_PREFIX + frame_len {
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let frame_data = src.split_to(frame_len);

        let message =
            decode_message(&frame_data).map_err(|e| CodecError::MessageError(e.to_string()))?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_message(&item).map_err(|e| CodecError::MessageError(e.to_string()))?;

        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        let len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge(body.len()))?;

        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(len);
        dst.put_slice(&body);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Message parse error: {0}")]
    MessageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
