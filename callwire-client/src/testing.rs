//! In-memory transports for unit tests.

use async_trait::async_trait;
use callwire_core::Message;
use callwire_transport::{Transport, TransportError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

type Handler = dyn Fn(&Message) -> Result<Message, TransportError> + Send + Sync;

/// Answers each request with a fixed function and records what it saw.
pub(crate) struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<Message>>,
}

impl MockTransport {
    pub(crate) fn new(
        handler: impl Fn(&Message) -> Result<Message, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(MockTransport {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Replies with the first argument of every request.
    pub(crate) fn echo() -> Arc<Self> {
        Self::new(|request| match request {
            Message::Request { id, args, .. } => Ok(Message::success(
                *id,
                args.first().cloned().unwrap_or(Value::Null),
            )),
            other => Err(TransportError::Protocol(format!("unexpected {other:?}"))),
        })
    }

    pub(crate) fn requests(&self) -> Vec<Message> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn round_trip(&self, request: Message) -> Result<Message, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(&request)
    }
}

/// Holds every request until a permit is released, counting round trips
/// that were dropped before their answer.
pub(crate) struct GatedTransport {
    gate: Semaphore,
    pub(crate) started: AtomicUsize,
    pub(crate) cancelled: AtomicUsize,
}

struct CancelGuard<'a> {
    cancelled: &'a AtomicUsize,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl GatedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(GatedTransport {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub(crate) fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn round_trip(&self, request: Message) -> Result<Message, TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut guard = CancelGuard {
            cancelled: &self.cancelled,
            armed: true,
        };
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        permit.forget();
        guard.armed = false;
        Ok(Message::success(request.id(), json!("released")))
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
