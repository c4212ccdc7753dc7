use crate::frame_codec::FrameCodec;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use callwire_core::Message;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

/// Transport that opens a TCP connection per operation, writes one framed
/// request and reads one framed response.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    endpoint: String,
    codec: FrameCodec,
}

impl TcpTransport {
    /// `endpoint` is anything `TcpStream::connect` accepts, e.g. `"127.0.0.1:8080"`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            codec: FrameCodec::new(),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.codec = FrameCodec::with_max_frame_size(max_frame_size);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn round_trip(&self, request: Message) -> Result<Message, TransportError> {
        let id = request.id();
        let stream = TcpStream::connect(&self.endpoint).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, self.codec.clone());

        trace!(call_id = %id, endpoint = %self.endpoint, "Sending request frame");
        framed.send(request).await?;

        match framed.next().await {
            Some(Ok(response)) => {
                if response.id() != id {
                    return Err(TransportError::Protocol(format!(
                        "expected answer to {}, got {}",
                        id,
                        response.id()
                    )));
                }
                trace!(call_id = %id, "Received response frame");
                Ok(response)
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}
