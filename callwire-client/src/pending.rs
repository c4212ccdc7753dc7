//! Shared handle to one outstanding call.

use crate::reply::{CallError, Reply};
use crate::watcher::PendingCallWatcher;
use callwire_core::{CallId, Headers};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

/// Completion slot shared by a call's task, its handles and its watchers.
///
/// Set exactly once: `Some(reply)` by the task on completion, or `None` by
/// the last handle when it is dropped first.
#[derive(Debug, Default)]
pub(crate) struct CallState {
    outcome: OnceLock<Option<Reply>>,
}

impl CallState {
    pub(crate) fn reply(&self) -> Option<&Reply> {
        self.outcome.get().and_then(Option::as_ref)
    }

    fn complete(&self, reply: Reply) -> bool {
        self.outcome.set(Some(reply)).is_ok()
    }

    fn cancel(&self) -> bool {
        self.outcome.set(None).is_ok()
    }
}

struct PendingCallInner {
    id: CallId,
    state: Arc<CallState>,
    done: watch::Receiver<bool>,
    abort: AbortHandle,
    runtime: Handle,
}

impl Drop for PendingCallInner {
    fn drop(&mut self) {
        if self.state.cancel() {
            debug!(id = %self.id, "Last handle dropped before completion, aborting call");
            self.abort.abort();
        }
    }
}

/// Handle to an outstanding asynchronous call.
///
/// Clones share one call. Dropping the last clone before the call finishes
/// aborts the underlying transport operation; any attached
/// [`PendingCallWatcher`] then reports nothing.
#[derive(Clone)]
pub struct PendingCall {
    inner: Arc<PendingCallInner>,
}

impl PendingCall {
    /// Run `operation` on `runtime` and return a handle to its result.
    pub(crate) fn spawn<F>(runtime: &Handle, id: CallId, operation: F) -> Self
    where
        F: Future<Output = Reply> + Send + 'static,
    {
        let state = Arc::new(CallState::default());
        let (done_tx, done_rx) = watch::channel(false);

        let task_state = Arc::clone(&state);
        let task = runtime.spawn(async move {
            let reply = operation.await;
            if task_state.complete(reply) {
                done_tx.send_replace(true);
            }
        });

        PendingCall {
            inner: Arc::new(PendingCallInner {
                id,
                state,
                done: done_rx,
                abort: task.abort_handle(),
                runtime: runtime.clone(),
            }),
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// Non-blocking check; completion is driven by the runtime, not by this call.
    pub fn is_finished(&self) -> bool {
        self.inner.state.reply().is_some()
    }

    /// The reply once finished, otherwise an empty [`Reply`].
    pub fn return_message(&self) -> Reply {
        self.inner.state.reply().cloned().unwrap_or_default()
    }

    pub fn return_value(&self) -> Value {
        self.inner
            .state
            .reply()
            .map(Reply::return_value)
            .unwrap_or_default()
    }

    pub fn return_headers(&self) -> Headers {
        self.inner
            .state
            .reply()
            .map(|r| r.headers().clone())
            .unwrap_or_default()
    }

    pub fn is_fault(&self) -> bool {
        self.inner.state.reply().is_some_and(Reply::is_fault)
    }

    pub fn fault_as_string(&self) -> String {
        self.inner
            .state
            .reply()
            .map(Reply::fault_as_string)
            .unwrap_or_default()
    }

    /// Number of live handles to this call.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Attach a watcher. It does not keep the call alive.
    pub fn watcher(&self) -> PendingCallWatcher {
        PendingCallWatcher::new(self)
    }

    /// Wait for the reply.
    pub async fn wait(&self) -> Reply {
        self.watcher()
            .finished()
            .await
            .unwrap_or_else(|| Reply::from_error(CallError::Cancelled))
    }

    pub(crate) fn state(&self) -> &Arc<CallState> {
        &self.inner.state
    }

    pub(crate) fn done(&self) -> watch::Receiver<bool> {
        self.inner.done.clone()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.inner.id)
            .field("finished", &self.is_finished())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{wait_for, GatedTransport};
    use crate::{ClientConfig, ClientInterface};
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_default_until_finished() {
        let transport = GatedTransport::new();
        let client = ClientInterface::with_transport(ClientConfig::default(), transport.clone()).unwrap();

        let call = client.async_call("slow", vec![]);
        assert!(!call.is_finished());
        assert_eq!(call.return_value(), Value::Null);
        assert!(call.return_headers().is_empty());
        assert!(!call.is_fault());

        transport.release(1);
        let reply = call.wait().await;
        assert!(call.is_finished());
        assert_eq!(reply.value(), &json!("released"));

        // stable once finished
        assert_eq!(call.return_message(), reply);
        assert_eq!(call.return_message(), call.return_message());
        assert_eq!(call.return_value(), json!("released"));
    }

    #[tokio::test]
    async fn test_clones_share_the_call() {
        let transport = GatedTransport::new();
        let client = ClientInterface::with_transport(ClientConfig::default(), transport.clone()).unwrap();

        let call = client.async_call("slow", vec![]);
        assert_eq!(call.ref_count(), 1);
        let copy = call.clone();
        assert_eq!(call.ref_count(), 2);
        assert_eq!(copy.id(), call.id());

        // dropping one of two handles does not cancel
        drop(copy);
        assert_eq!(call.ref_count(), 1);
        transport.release(1);
        call.wait().await;
        assert_eq!(transport.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_cancels_transport() {
        let transport = GatedTransport::new();
        let client = ClientInterface::with_transport(ClientConfig::default(), transport.clone()).unwrap();

        let call = client.async_call("slow", vec![]);
        let watcher = call.watcher();
        let started = Arc::clone(&transport);
        wait_for(move || started.started.load(Ordering::SeqCst) == 1).await;

        drop(call);
        assert_eq!(watcher.finished().await, None);

        let cancelled = Arc::clone(&transport);
        wait_for(move || cancelled.cancelled.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_dropping_finished_call_does_not_cancel() {
        let transport = GatedTransport::new();
        let client = ClientInterface::with_transport(ClientConfig::default(), transport.clone()).unwrap();

        transport.release(1);
        let call = client.async_call("fast", vec![]);
        let watcher = call.watcher();
        call.wait().await;
        drop(call);

        let reply = watcher.finished().await;
        assert_eq!(reply.map(|r| r.return_value()), Some(json!("released")));
        assert_eq!(transport.cancelled.load(Ordering::SeqCst), 0);
    }
}
