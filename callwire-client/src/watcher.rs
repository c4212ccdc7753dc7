use crate::pending::{CallState, PendingCall};
use crate::reply::Reply;
use callwire_core::CallId;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::trace;

/// One-shot completion notification for a [`PendingCall`].
///
/// A watcher attached after its call finished still fires. It does not hold
/// the call alive: if every call handle is dropped first, the watcher yields
/// nothing.
pub struct PendingCallWatcher {
    id: CallId,
    state: Arc<CallState>,
    done: watch::Receiver<bool>,
    runtime: Handle,
}

impl PendingCallWatcher {
    pub fn new(call: &PendingCall) -> Self {
        PendingCallWatcher {
            id: call.id(),
            state: Arc::clone(call.state()),
            done: call.done(),
            runtime: call.runtime().clone(),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.state.reply().is_some()
    }

    /// Resolves with the reply once the call finishes, or `None` when the
    /// call was cancelled.
    pub async fn finished(mut self) -> Option<Reply> {
        if self.state.reply().is_none() {
            // Err means the call task is gone; the slot tells us why.
            let _ = self.done.wait_for(|done| *done).await;
        }
        self.state.reply().cloned()
    }

    /// Run `callback` once with the reply, on the runtime that owns the call.
    pub fn on_finished<F>(self, callback: F)
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            let id = self.id;
            match self.finished().await {
                Some(reply) => callback(reply),
                None => trace!(%id, "Call cancelled, watcher not notified"),
            }
        });
    }
}

impl std::fmt::Debug for PendingCallWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallWatcher")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{wait_for, GatedTransport, MockTransport};
    use crate::{ClientConfig, ClientInterface};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_watcher_attached_after_finish_fires_once() {
        let client = ClientInterface::with_transport(ClientConfig::default(), MockTransport::echo()).unwrap();
        let call = client.async_call("echo", vec![json!("hi")]);
        call.wait().await;
        assert!(call.is_finished());

        let watcher = call.watcher();
        assert!(watcher.is_finished());
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.on_finished(move |reply| {
            let _ = tx.send(reply.return_value());
        });

        assert_eq!(rx.recv().await, Some(json!("hi")));
        // the sender moved into the callback is gone after its single run
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_every_watcher_fires_exactly_once() {
        let transport = GatedTransport::new();
        let client = ClientInterface::with_transport(ClientConfig::default(), transport.clone()).unwrap();
        let call = client.async_call("slow", vec![]);

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            call.watcher().on_finished(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        transport.release(1);
        call.wait().await;
        let counted = Arc::clone(&fired);
        wait_for(move || counted.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_call_never_notifies() {
        let transport = GatedTransport::new();
        let client = ClientInterface::with_transport(ClientConfig::default(), transport.clone()).unwrap();
        let call = client.async_call("slow", vec![]);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        call.watcher().on_finished(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let started = Arc::clone(&transport);
        wait_for(move || started.started.load(Ordering::SeqCst) == 1).await;
        drop(call);

        // a late release must not resurrect the call
        transport.release(1);
        let cancelled = Arc::clone(&transport);
        wait_for(move || cancelled.cancelled.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
