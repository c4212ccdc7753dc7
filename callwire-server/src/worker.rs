//! One worker execution context: an OS thread driving a single-threaded
//! runtime that owns a subset of the pool's connections.
//!
//! Connections arrive as owned `std` sockets over the worker's command
//! channel; the accepting side never touches them again. Per-server
//! counters live in [`WorkerCounters`], written by the pool at hand-off and
//! by the worker when a connection ends, and read by the pool when
//! aggregating.

use crate::connection::serve_connection;
use crate::pool::PoolError;
use crate::server::ServerInner;
use callwire_core::{ConnectionId, ServerId};
use dashmap::DashMap;
use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

thread_local! {
    /// `(pool id, worker index)` of the worker running on this thread.
    static CURRENT_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Returns the pool id and index of the worker owning the calling thread.
pub(crate) fn current_worker() -> Option<(u64, usize)> {
    CURRENT_WORKER.with(Cell::get)
}

/// Starts an OS thread running the given body. Swapped out in tests to
/// simulate thread exhaustion.
pub(crate) type SpawnThread =
    fn(std::thread::Builder, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;

pub(crate) fn spawn_os_thread(
    builder: std::thread::Builder,
    body: Box<dyn FnOnce() + Send>,
) -> io::Result<JoinHandle<()>> {
    builder.spawn(body)
}

/// Adds one permit to a shared barrier when dropped, whether or not the
/// receiving worker ever ran the command carrying it.
pub(crate) struct CompletionSignal(Arc<Semaphore>);

impl CompletionSignal {
    pub(crate) fn new(barrier: Arc<Semaphore>) -> Self {
        CompletionSignal(barrier)
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.0.add_permits(1);
    }
}

pub(crate) enum WorkerCommand {
    Accept {
        id: ConnectionId,
        stream: std::net::TcpStream,
        server: Arc<ServerInner>,
    },
    Disconnect {
        server: ServerId,
        done: CompletionSignal,
    },
    Quit,
}

#[derive(Debug, Default, Clone, Copy)]
struct ServerCounters {
    live: usize,
    total: usize,
}

#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    active: AtomicUsize,
    per_server: DashMap<ServerId, ServerCounters>,
}

impl WorkerCounters {
    fn register(&self, server: ServerId) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let mut entry = self.per_server.entry(server).or_default();
        entry.live += 1;
        entry.total += 1;
    }

    /// Undo a [`register`](Self::register) whose hand-off never happened.
    fn unregister(&self, server: ServerId) {
        self.release(server);
        if let Some(mut entry) = self.per_server.get_mut(&server) {
            entry.total = entry.total.saturating_sub(1);
        }
    }

    fn release(&self, server: ServerId) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if let Some(mut entry) = self.per_server.get_mut(&server) {
            entry.live = entry.live.saturating_sub(1);
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn live(&self, server: ServerId) -> usize {
        self.per_server.get(&server).map_or(0, |c| c.live)
    }

    fn total(&self, server: ServerId) -> usize {
        self.per_server.get(&server).map_or(0, |c| c.total)
    }

    fn reset_total(&self, server: ServerId) {
        if let Some(mut entry) = self.per_server.get_mut(&server) {
            entry.total = 0;
        }
    }
}

/// Handle held by the pool for one worker thread.
pub(crate) struct ServerWorker {
    index: usize,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    counters: Arc<WorkerCounters>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerWorker {
    /// Start a worker thread. Fails when the thread or its runtime cannot be
    /// created.
    ///
    /// The runtime is built on the new thread and never leaves it, so a
    /// failed start can be reported from inside an async context.
    pub(crate) fn spawn(
        pool_id: u64,
        index: usize,
        drain_timeout: Duration,
        spawn_thread: SpawnThread,
    ) -> Result<Self, PoolError> {
        let (commands, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(WorkerCounters::default());
        let worker_loop = WorkerLoop::new(index, rx, Arc::clone(&counters), drain_timeout);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<io::Result<()>>(1);

        let builder = std::thread::Builder::new().name(format!("callwire-worker-{index}"));
        let thread = spawn_thread(
            builder,
            Box::new(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                CURRENT_WORKER.with(|current| current.set(Some((pool_id, index))));
                runtime.block_on(worker_loop.run());
                CURRENT_WORKER.with(|current| current.set(None));
            }),
        )
        .map_err(PoolError::WorkerSpawn)?;

        let started = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("worker thread exited during startup")),
        };
        if let Err(e) = started {
            let _ = thread.join();
            return Err(PoolError::WorkerSpawn(e));
        }

        info!(worker = index, "Worker started");
        Ok(ServerWorker {
            index,
            commands,
            counters,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Transfer ownership of `stream` to this worker. Counters are updated
    /// before the hand-off so a concurrent selection already sees the load.
    pub(crate) fn accept_connection(
        &self,
        stream: std::net::TcpStream,
        server: Arc<ServerInner>,
    ) -> Result<(), PoolError> {
        let server_id = server.id;
        self.counters.register(server_id);
        let command = WorkerCommand::Accept {
            id: ConnectionId::next(),
            stream,
            server,
        };
        if self.commands.send(command).is_err() {
            self.counters.unregister(server_id);
            return Err(PoolError::WorkerGone(self.index));
        }
        Ok(())
    }

    /// Ask the worker to close every connection of `server`. `done` is
    /// signalled once they are closed, or right away if the worker is gone.
    pub(crate) fn request_disconnect(&self, server: ServerId, done: CompletionSignal) {
        if self
            .commands
            .send(WorkerCommand::Disconnect { server, done })
            .is_err()
        {
            debug!(worker = self.index, "Disconnect sent to stopped worker");
        }
    }

    pub(crate) fn request_quit(&self) {
        let _ = self.commands.send(WorkerCommand::Quit);
    }

    /// Wait for the worker thread to exit. Later calls return immediately.
    pub(crate) fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.join().is_err() {
            error!(worker = self.index, "Worker thread panicked");
        } else {
            debug!(worker = self.index, "Worker joined");
        }
    }

    pub(crate) fn active_connection_count(&self) -> usize {
        self.counters.active()
    }

    pub(crate) fn live_connection_count(&self, server: ServerId) -> usize {
        self.counters.live(server)
    }

    pub(crate) fn total_connection_count(&self, server: ServerId) -> usize {
        self.counters.total(server)
    }

    pub(crate) fn reset_total_connection_count(&self, server: ServerId) {
        self.counters.reset_total(server)
    }
}

struct ConnectionEntry {
    server: ServerId,
    drain: CancellationToken,
    task: task::JoinHandle<()>,
}

/// Reports a connection task's end to its worker loop, including on abort.
struct ClosedGuard {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionId>,
}

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}

struct WorkerLoop {
    index: usize,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    counters: Arc<WorkerCounters>,
    drain_timeout: Duration,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    closed_tx: mpsc::UnboundedSender<ConnectionId>,
    closed_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl WorkerLoop {
    fn new(
        index: usize,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        counters: Arc<WorkerCounters>,
        drain_timeout: Duration,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        WorkerLoop {
            index,
            commands,
            counters,
            drain_timeout,
            connections: HashMap::new(),
            closed_tx,
            closed_rx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(id) = self.closed_rx.recv() => self.connection_closed(id),
                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Accept { id, stream, server }) => self.accept(id, stream, server),
                    Some(WorkerCommand::Disconnect { server, done }) => {
                        self.disconnect(server).await;
                        drop(done);
                    }
                    Some(WorkerCommand::Quit) | None => break,
                },
            }
        }
        self.quit().await;
    }

    fn accept(&mut self, id: ConnectionId, stream: std::net::TcpStream, server: Arc<ServerInner>) {
        let server_id = server.id;
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(worker = self.index, error = %e, "Failed to configure connection");
            self.counters.release(server_id);
            return;
        }
        let stream = match tokio::net::TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(worker = self.index, error = %e, "Failed to register connection");
                self.counters.release(server_id);
                return;
            }
        };

        let drain = CancellationToken::new();
        let guard = ClosedGuard {
            id,
            tx: self.closed_tx.clone(),
        };
        let task = task::spawn(serve_with_guard(id, stream, server, drain.clone(), guard));
        self.connections.insert(
            id,
            ConnectionEntry {
                server: server_id,
                drain,
                task,
            },
        );
        debug!(worker = self.index, conn = id.as_u64(), server_id = %server_id, "Connection accepted");
    }

    fn connection_closed(&mut self, id: ConnectionId) {
        // Entries already removed by a disconnect or quit were released there.
        if let Some(entry) = self.connections.remove(&id) {
            self.counters.release(entry.server);
        }
    }

    async fn disconnect(&mut self, server: ServerId) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.server == server)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(entry) = self.connections.remove(id) {
                entry.task.abort();
                let _ = entry.task.await;
                self.counters.release(server);
            }
        }
        debug!(worker = self.index, server_id = %server, closed = ids.len(), "Disconnected server connections");
    }

    async fn quit(mut self) {
        // Nothing queued behind Quit will be served.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let WorkerCommand::Accept { server, .. } = command {
                self.counters.release(server.id);
            }
        }

        let connections = std::mem::take(&mut self.connections);
        for entry in connections.values() {
            entry.drain.cancel();
        }

        let deadline = Instant::now() + self.drain_timeout;
        for (id, mut entry) in connections {
            if timeout_at(deadline, &mut entry.task).await.is_err() {
                warn!(worker = self.index, conn = id.as_u64(), "Connection did not drain in time, aborting");
                entry.task.abort();
                let _ = entry.task.await;
            }
            self.counters.release(entry.server);
        }
        info!(worker = self.index, "Worker stopped");
    }
}

async fn serve_with_guard(
    id: ConnectionId,
    stream: tokio::net::TcpStream,
    server: Arc<ServerInner>,
    drain: CancellationToken,
    _guard: ClosedGuard,
) {
    serve_connection(id, stream, server, drain).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_live_and_total() {
        let counters = WorkerCounters::default();
        let a = ServerId::next();
        let b = ServerId::next();

        counters.register(a);
        counters.register(a);
        counters.register(b);
        assert_eq!(counters.active(), 3);
        assert_eq!(counters.live(a), 2);

        counters.release(a);
        assert_eq!(counters.live(a), 1);
        assert_eq!(counters.total(a), 2);
        assert_eq!(counters.active(), 2);

        counters.reset_total(a);
        assert_eq!(counters.total(a), 0);
        assert_eq!(counters.live(a), 1);
        assert_eq!(counters.total(b), 1);
    }

    #[test]
    fn test_counters_unregister_and_saturate() {
        let counters = WorkerCounters::default();
        let server = ServerId::next();

        counters.register(server);
        counters.unregister(server);
        assert_eq!(counters.active(), 0);
        assert_eq!(counters.live(server), 0);
        assert_eq!(counters.total(server), 0);

        counters.release(server);
        assert_eq!(counters.active(), 0);
        assert_eq!(counters.live(ServerId::next()), 0);
    }

    #[tokio::test]
    async fn test_completion_signal_adds_permit_on_drop() {
        let barrier = Arc::new(Semaphore::new(0));
        let signals: Vec<_> = (0..3)
            .map(|_| CompletionSignal::new(Arc::clone(&barrier)))
            .collect();
        assert_eq!(barrier.available_permits(), 0);
        drop(signals);
        let permit = barrier.acquire_many(3).await.unwrap();
        drop(permit);
    }
}
