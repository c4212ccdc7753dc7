use crate::server::ServerInner;
use callwire_core::{ConnectionId, Headers, Message, Outcome};
use callwire_transport::FrameCodec;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Serve requests on one connection until the peer closes it, a frame error
/// occurs, or `drain` is cancelled.
///
/// Cancellation is only observed between requests, so a request being
/// dispatched is always answered.
pub(crate) async fn serve_connection(
    conn_id: ConnectionId,
    stream: TcpStream,
    server: Arc<ServerInner>,
    drain: CancellationToken,
) {
    let codec = FrameCodec::with_max_frame_size(server.config.max_frame_size);
    let mut framed = Framed::new(stream, codec);
    debug!(conn = conn_id.as_u64(), server_id = %server.id, "Connection opened");

    loop {
        let frame = tokio::select! {
            biased;
            () = drain.cancelled() => {
                debug!(conn = conn_id.as_u64(), "Connection drained");
                break;
            }
            frame = framed.next() => frame,
        };

        match frame {
            Some(Ok(message)) => {
                let Some(reply) = dispatch(&server, message).await else {
                    continue;
                };
                if let Err(e) = framed.send(reply).await {
                    warn!(conn = conn_id.as_u64(), error = %e, "Failed to send reply");
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(conn = conn_id.as_u64(), error = %e, "Closing connection after frame error");
                break;
            }
            None => {
                debug!(conn = conn_id.as_u64(), "Peer closed connection");
                break;
            }
        }
    }
}

/// Produce the reply for one inbound message, or `None` when it needs none.
pub(crate) async fn dispatch(server: &ServerInner, message: Message) -> Option<Message> {
    let (id, method, args, headers) = match message {
        Message::Request {
            id,
            method,
            args,
            headers,
        } => (id, method, args, headers),
        other => {
            warn!(id = %other.id(), "Ignoring non-request message from client");
            return None;
        }
    };

    if let Some(authenticator) = server.authenticator() {
        if !authenticator.authenticate(&headers) {
            debug!(%id, %method, realm = authenticator.realm(), "Request not authenticated");
            return Some(Message::AuthChallenge {
                id,
                realm: authenticator.realm().to_string(),
            });
        }
    }

    trace!(%id, %method, "Dispatching request");
    let outcome = match server.target().call(&method, args, &headers).await {
        Ok(value) => Outcome::Success { value },
        Err(fault) => {
            debug!(%id, %method, fault = %fault, "Request faulted");
            Outcome::Fault { fault }
        }
    };

    Some(Message::Response {
        id,
        outcome,
        headers: Headers::new(),
    })
}
