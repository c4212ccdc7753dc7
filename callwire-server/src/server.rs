use crate::auth::Authenticator;
use crate::pool::{PoolConfig, PoolError, WorkerPool};
use async_trait::async_trait;
use callwire_core::{Fault, Headers, ServerId};
use callwire_transport::DEFAULT_MAX_FRAME_SIZE;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Service logic invoked for every request a server receives.
#[async_trait]
pub trait RpcTarget: Send + Sync {
    async fn call(&self, method: &str, args: Vec<Value>, headers: &Headers) -> Result<Value, Fault>;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on worker threads when the server creates its own pool.
    pub max_workers: usize,
    /// Connections beyond this many live ones are closed on accept.
    pub max_connections: Option<usize>,
    /// How long a quitting worker lets connections finish their current request.
    pub drain_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_workers: pool.max_workers,
            max_connections: None,
            drain_timeout: pool.drain_timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// State a worker needs to serve a connection for one logical server.
pub(crate) struct ServerInner {
    pub(crate) id: ServerId,
    pub(crate) config: ServerConfig,
    target: Arc<dyn RpcTarget>,
    authenticator: RwLock<Option<Arc<dyn Authenticator>>>,
}

impl ServerInner {
    pub(crate) fn target(&self) -> &Arc<dyn RpcTarget> {
        &self.target
    }

    pub(crate) fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.authenticator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One logical server: a service target plus the listening side.
///
/// Several servers may share one [`WorkerPool`]; their connections are told
/// apart by [`ServerId`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
    pool: Arc<WorkerPool>,
}

impl Server {
    /// Create a server with its own worker pool.
    pub fn new(config: ServerConfig, target: Arc<dyn RpcTarget>) -> Self {
        let pool = Arc::new(WorkerPool::new(config.pool_config()));
        Self::with_pool(config, target, pool)
    }

    /// Create a server that hands its connections to an existing pool.
    pub fn with_pool(config: ServerConfig, target: Arc<dyn RpcTarget>, pool: Arc<WorkerPool>) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                id: ServerId::next(),
                config,
                target,
                authenticator: RwLock::new(None),
            }),
            pool,
        }
    }

    pub fn id(&self) -> ServerId {
        self.inner.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub(crate) fn inner(&self) -> Arc<ServerInner> {
        Arc::clone(&self.inner)
    }

    /// Require every request to pass `authenticator`. Applies to requests
    /// read after the call, including those on open connections.
    pub fn set_authenticator(&self, authenticator: Option<Arc<dyn Authenticator>>) {
        *self
            .inner
            .authenticator
            .write()
            .unwrap_or_else(PoisonError::into_inner) = authenticator;
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        TcpListener::bind(&addr).await
    }

    /// Bind to the configured address and serve until Ctrl+C.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        })
        .await?;

        if let Err(e) = self.disconnect_sockets().await {
            warn!(error = %e, "Failed to disconnect sockets after shutdown");
        }
        Ok(())
    }

    /// Accept connections from `listener` until `shutdown` resolves.
    ///
    /// Each accepted socket is handed to the pool as an owned stream; the
    /// chosen worker owns it from then on.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let local_addr = listener.local_addr()?;
        info!(server_id = %self.id(), addr = %local_addr, "Server listening");

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(server_id = %self.id(), "Server stopped accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_accepted(stream, peer),
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        Ok(())
    }

    fn handle_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        if let Some(max) = self.inner.config.max_connections {
            let live = self.num_connected_sockets();
            if live >= max {
                warn!(server_id = %self.id(), %peer, live, max, "Connection limit reached, closing connection");
                return;
            }
        }

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to detach accepted socket");
                return;
            }
        };

        match self.pool.handle_incoming_connection(stream, self) {
            Ok(worker) => debug!(server_id = %self.id(), %peer, worker, "Connection assigned"),
            Err(e) => warn!(server_id = %self.id(), %peer, error = %e, "Connection rejected"),
        }
    }

    pub fn num_connected_sockets(&self) -> usize {
        self.pool.num_connected_sockets(self.id())
    }

    pub fn total_connection_count(&self) -> usize {
        self.pool.total_connection_count(self.id())
    }

    pub fn reset_total_connection_count(&self) {
        self.pool.reset_total_connection_count(self.id())
    }

    /// Close every live connection of this server, waiting for all workers.
    pub async fn disconnect_sockets(&self) -> Result<(), PoolError> {
        self.pool.disconnect_sockets(self.id()).await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
