//! Bounded pool of worker threads shared by one or more servers.
//!
//! All scheduling decisions happen under one lock, so
//! [`WorkerPool::handle_incoming_connection`] may be called concurrently
//! from any number of accepting contexts.

use crate::server::Server;
use crate::worker::{current_worker, spawn_os_thread, CompletionSignal, ServerWorker, SpawnThread};
use callwire_core::ServerId;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("failed to start worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("worker {0} is no longer running")]
    WorkerGone(usize),

    #[error("disconnect_sockets cannot be called from a worker of the same pool")]
    WorkerContext,

    #[error("completion barrier closed")]
    BarrierClosed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// How long quitting workers wait for connections to finish their
    /// current request before aborting them.
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// Outcome of [`select_worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Hand the connection to the worker at this index.
    Existing(usize),
    /// Start a new worker and hand the connection to it.
    Spawn,
}

/// Choose a worker for a new connection given each worker's current load.
///
/// The first idle worker wins. Failing that, a new worker is started while
/// fewer than `max_workers` exist; at the cap the least-loaded worker is
/// reused, ties going to the lowest index.
pub fn select_worker(loads: &[usize], max_workers: usize) -> Selection {
    let mut best: Option<(usize, usize)> = None;
    for (index, &load) in loads.iter().enumerate() {
        if load == 0 {
            return Selection::Existing(index);
        }
        if best.is_none_or(|(_, min)| load < min) {
            best = Some((index, load));
        }
    }

    match best {
        Some((index, _)) if loads.len() >= max_workers => Selection::Existing(index),
        _ => Selection::Spawn,
    }
}

struct PoolState {
    workers: Vec<Arc<ServerWorker>>,
    max_workers: usize,
    shut_down: bool,
    spawn_thread: SpawnThread,
}

pub struct WorkerPool {
    id: u64,
    drain_timeout: Duration,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        WorkerPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            drain_timeout: config.drain_timeout,
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                max_workers: config.max_workers.max(1),
                shut_down: false,
                spawn_thread: spawn_os_thread,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn set_thread_spawner(&self, spawn_thread: SpawnThread) {
        self.state().spawn_thread = spawn_thread;
    }

    fn workers(&self) -> Vec<Arc<ServerWorker>> {
        self.state().workers.clone()
    }

    /// Assign `stream` to a worker, starting one if needed, and transfer
    /// ownership of it. Returns the chosen worker's index.
    ///
    /// On error the stream is dropped, which closes the connection; the pool
    /// stays usable.
    pub fn handle_incoming_connection(
        &self,
        stream: std::net::TcpStream,
        server: &Server,
    ) -> Result<usize, PoolError> {
        let mut state = self.state();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }

        let loads: Vec<usize> = state
            .workers
            .iter()
            .map(|w| w.active_connection_count())
            .collect();

        let worker = match select_worker(&loads, state.max_workers) {
            Selection::Existing(index) => Arc::clone(&state.workers[index]),
            Selection::Spawn => {
                let index = state.workers.len();
                let worker = match ServerWorker::spawn(self.id, index, self.drain_timeout, state.spawn_thread) {
                    Ok(worker) => Arc::new(worker),
                    Err(e) => {
                        warn!(pool = self.id, error = %e, "Could not start worker, dropping connection");
                        return Err(e);
                    }
                };
                state.workers.push(Arc::clone(&worker));
                worker
            }
        };

        worker.accept_connection(stream, server.inner())?;
        Ok(worker.index())
    }

    pub fn num_connected_sockets(&self, server: ServerId) -> usize {
        self.workers()
            .iter()
            .map(|w| w.live_connection_count(server))
            .sum()
    }

    pub fn total_connection_count(&self, server: ServerId) -> usize {
        self.workers()
            .iter()
            .map(|w| w.total_connection_count(server))
            .sum()
    }

    pub fn reset_total_connection_count(&self, server: ServerId) {
        for worker in self.workers() {
            worker.reset_total_connection_count(server);
        }
    }

    /// Close every connection of `server` on every worker and wait until all
    /// workers have done so.
    ///
    /// The requests go out to all workers before waiting on any of them.
    pub async fn disconnect_sockets(&self, server: ServerId) -> Result<(), PoolError> {
        if matches!(current_worker(), Some((pool, _)) if pool == self.id) {
            return Err(PoolError::WorkerContext);
        }

        let workers = self.workers();
        let count = u32::try_from(workers.len()).map_err(|_| PoolError::BarrierClosed)?;
        let barrier = Arc::new(Semaphore::new(0));
        for worker in &workers {
            worker.request_disconnect(server, CompletionSignal::new(Arc::clone(&barrier)));
        }

        let _permits = barrier
            .acquire_many(count)
            .await
            .map_err(|_| PoolError::BarrierClosed)?;
        debug!(pool = self.id, server_id = %server, workers = workers.len(), "Server sockets disconnected");
        Ok(())
    }

    /// Stop every worker: all are asked to quit before any is joined.
    /// Calling this again is a no-op.
    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.workers)
        };
        if workers.is_empty() {
            return;
        }

        info!(pool = self.id, workers = workers.len(), "Shutting down worker pool");
        for worker in &workers {
            worker.request_quit();
        }

        let current = std::thread::current().id();
        for worker in &workers {
            if worker.thread_id() == current {
                warn!(pool = self.id, worker = worker.index(), "Skipping join of the calling worker thread");
                continue;
            }
            worker.join();
        }
        info!(pool = self.id, "Worker pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn worker_count(&self) -> usize {
        self.state().workers.len()
    }

    /// Current connection count of each worker, in selection order.
    pub fn worker_loads(&self) -> Vec<usize> {
        self.state()
            .workers
            .iter()
            .map(|w| w.active_connection_count())
            .collect()
    }

    pub fn max_workers(&self) -> usize {
        self.state().max_workers
    }

    /// Change the worker cap. Existing workers above a lowered cap keep
    /// running; no new ones are started until the count drops below it.
    pub fn set_max_workers(&self, max_workers: usize) {
        self.state().max_workers = max_workers.max(1);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("workers", &state.workers.len())
            .field("max_workers", &state.max_workers)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
