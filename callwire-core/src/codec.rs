use crate::Message;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("message codec error: {0}")]
pub struct MessageCodecError(#[from] serde_json::Error);

pub fn encode_message(msg: &Message) -> Result<Bytes, MessageCodecError> {
    let json = serde_json::to_vec(msg)?;
    Ok(Bytes::from(json))
}

pub fn decode_message(data: &[u8]) -> Result<Message, MessageCodecError> {
    let msg = serde_json::from_slice(data)?;
    Ok(msg)
}
