use async_trait::async_trait;
use callwire_core::Message;
use thiserror::Error;

use crate::frame_codec::CodecError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Carries one request to the peer and yields its answer.
///
/// Each `round_trip` is a single transport operation. Callers start it by
/// spawning the future and abort it by dropping or aborting that task, so an
/// implementation must leave no shared state half-written at an `.await`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Message) -> Result<Message, TransportError>;
}
