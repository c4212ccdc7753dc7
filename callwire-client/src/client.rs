use crate::auth::Authentication;
use crate::pending::PendingCall;
use crate::reply::{CallError, Reply};
use anyhow::{Context, Result};
use callwire_core::{CallId, Headers, Message, AUTHORIZATION};
use callwire_transport::{TcpTransport, Transport, DEFAULT_MAX_FRAME_SIZE};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server
    pub endpoint: String,
    /// Time allowed for one call, including an authentication resend
    pub timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8080".to_string(),
            timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    persistent_headers: RwLock<Headers>,
    authentication: RwLock<Option<Arc<dyn Authentication>>>,
    next_call_id: AtomicU64,
    runtime: Handle,
}

/// Entry point for issuing calls to one endpoint.
///
/// Cheap to clone; clones share headers, authentication and the call id
/// counter. Every call runs as a task on the runtime the client was built
/// in.
#[derive(Clone)]
pub struct ClientInterface {
    inner: Arc<ClientInner>,
}

impl ClientInterface {
    /// Create a client talking TCP to `config.endpoint`. Must be called
    /// inside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::new(config.endpoint.clone())
            .with_max_frame_size(config.max_frame_size);
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport. Must be called inside a
    /// Tokio runtime.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let runtime = Handle::try_current().context("ClientInterface needs a Tokio runtime")?;
        Ok(Self::with_runtime(config, transport, runtime))
    }

    /// Create a client whose calls run on `runtime`, usable from threads
    /// outside any runtime.
    pub fn with_runtime(config: ClientConfig, transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                persistent_headers: RwLock::new(Headers::new()),
                authentication: RwLock::new(None),
                next_call_id: AtomicU64::new(1),
                runtime,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.config.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    /// Attach `name: value` to every subsequent request.
    pub fn set_header(&self, name: impl AsRef<str>, value: impl Into<Value>) {
        self.inner
            .persistent_headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
    }

    pub fn remove_header(&self, name: &str) -> Option<Value> {
        self.inner
            .persistent_headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn headers(&self) -> Headers {
        self.inner.persistent_headers()
    }

    pub fn set_authentication(&self, authentication: Option<Arc<dyn Authentication>>) {
        *self
            .inner
            .authentication
            .write()
            .unwrap_or_else(PoisonError::into_inner) = authentication;
    }

    /// Start a call and return at once.
    pub fn async_call(&self, method: &str, args: Vec<Value>) -> PendingCall {
        self.async_call_with_headers(method, args, Headers::new())
    }

    /// Start a call with extra headers, which override persistent ones.
    pub fn async_call_with_headers(&self, method: &str, args: Vec<Value>, headers: Headers) -> PendingCall {
        let id = CallId::new(self.inner.next_call_id.fetch_add(1, Ordering::SeqCst));
        let inner = Arc::clone(&self.inner);
        let method = method.to_string();
        trace!(%id, %method, "Issuing call");
        PendingCall::spawn(&self.inner.runtime, id, async move {
            inner.perform(id, method, args, headers).await
        })
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Reply {
        self.async_call(method, args).wait().await
    }

    pub async fn call_with_headers(&self, method: &str, args: Vec<Value>, headers: Headers) -> Reply {
        self.async_call_with_headers(method, args, headers).wait().await
    }

    /// Issue a call and block the current thread until it completes.
    ///
    /// For callers outside any async context: calling this on a runtime
    /// thread panics.
    pub fn blocking_call(&self, method: &str, args: Vec<Value>) -> Reply {
        let call = self.async_call(method, args);
        self.inner.runtime.block_on(call.wait())
    }

    /// Issue a call and run `callback` once with its reply.
    ///
    /// The call stays alive until the callback has run, even if the
    /// returned handle is dropped.
    pub fn call_with_callback<F>(&self, method: &str, args: Vec<Value>, callback: F) -> PendingCall
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let call = self.async_call(method, args);
        let keep_alive = call.clone();
        call.watcher().on_finished(move |reply| {
            drop(keep_alive);
            callback(reply);
        });
        call
    }
}

impl ClientInner {
    fn persistent_headers(&self) -> Headers {
        self.persistent_headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn authentication(&self) -> Option<Arc<dyn Authentication>> {
        self.authentication
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn perform(&self, id: CallId, method: String, args: Vec<Value>, headers: Headers) -> Reply {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.exchange(id, method, args, headers)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(%id, ?timeout, "Call timed out");
                Reply::from_error(CallError::Timeout(timeout))
            }
        }
    }

    async fn exchange(&self, id: CallId, method: String, args: Vec<Value>, call_headers: Headers) -> Reply {
        let authentication = self.authentication();
        let mut headers = self.persistent_headers().merged(&call_headers);
        if let Some(auth) = &authentication {
            headers.merge(&auth.request_headers());
        }

        let request = Message::request(id, method.clone(), args.clone(), headers.clone());
        let realm = match self.transport.round_trip(request).await {
            Ok(Message::AuthChallenge { realm, .. }) => realm,
            Ok(response) => return Reply::from_message(response),
            Err(e) => return transport_failure(id, e),
        };

        let Some(credentials) = authentication.and_then(|auth| auth.credentials(&realm)) else {
            debug!(%id, %realm, "Challenged without credentials to offer");
            return Reply::from_error(CallError::AuthenticationRequired(realm));
        };

        debug!(%id, %realm, "Resending call with credentials");
        headers.insert(AUTHORIZATION, credentials.to_header_value());
        match self
            .transport
            .round_trip(Message::request(id, method, args, headers))
            .await
        {
            Ok(Message::AuthChallenge { realm, .. }) => {
                debug!(%id, %realm, "Credentials rejected");
                Reply::from_error(CallError::AuthenticationRequired(realm))
            }
            Ok(response) => Reply::from_message(response),
            Err(e) => transport_failure(id, e),
        }
    }
}

fn transport_failure(id: CallId, error: callwire_transport::TransportError) -> Reply {
    debug!(%id, error = %error, "Call failed in transport");
    Reply::from_error(CallError::Transport(error.to_string()))
}

impl std::fmt::Debug for ClientInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInterface")
            .field("config", &self.inner.config)
            .field("headers", &self.inner.persistent_headers())
            .finish_non_exhaustive()
    }
}
