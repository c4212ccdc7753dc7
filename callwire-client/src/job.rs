//! Self-contained call objects with a `Created -> Started -> Finished`
//! lifecycle.
//!
//! A [`Job`] wraps request logic supplied through [`JobRequest`]. The logic
//! runs as a task once the job is started and reports back through
//! [`Job::emit_finished`]. Observers registered with [`Job::on_finished`]
//! run once, in registration order, before the job is disposed.
//!
//! A contract violation (starting twice, finishing before start or twice)
//! kills the job: every later `start` or `emit_finished` fails and pending
//! observers are dropped without running.

use crate::client::ClientInterface;
use crate::reply::Reply;
use async_trait::async_trait;
use callwire_core::Headers;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Started,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job was used out of order, now or earlier. Fatal for the job.
    #[error("contract violation: {operation} called while job is {state:?}")]
    ContractViolation {
        operation: &'static str,
        state: JobState,
    },

    #[error("no Tokio runtime to run the job on")]
    NoRuntime,
}

/// The work a [`Job`] performs once started.
///
/// Implementations must call [`Job::emit_finished`] exactly once.
#[async_trait]
pub trait JobRequest: Send + Sync + 'static {
    async fn do_start(&self, job: &Job);
}

type Observer = Box<dyn FnOnce(&Job) + Send>;

struct JobInner {
    state: JobState,
    request_headers: Headers,
    reply: Option<Reply>,
    observers: Vec<Observer>,
    failed: bool,
}

struct JobShared {
    request: Arc<dyn JobRequest>,
    inner: Mutex<JobInner>,
    auto_delete: AtomicBool,
    disposed: AtomicBool,
    finished: watch::Sender<bool>,
}

/// Handle to one job. Clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    shared: Arc<JobShared>,
}

impl Job {
    pub fn new(request: impl JobRequest) -> Self {
        Job {
            shared: Arc::new(JobShared {
                request: Arc::new(request),
                inner: Mutex::new(JobInner {
                    state: JobState::Created,
                    request_headers: Headers::new(),
                    reply: None,
                    observers: Vec::new(),
                    failed: false,
                }),
                auto_delete: AtomicBool::new(true),
                disposed: AtomicBool::new(false),
                finished: watch::channel(false).0,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, JobInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the job dead and drop its pending observers.
    fn violation(&self, mut inner: MutexGuard<'_, JobInner>, operation: &'static str) -> JobError {
        let state = inner.state;
        inner.failed = true;
        let observers = std::mem::take(&mut inner.observers);
        drop(inner);
        drop(observers);
        error!(operation, ?state, "Job contract violation");
        JobError::ContractViolation { operation, state }
    }

    pub fn state(&self) -> JobState {
        self.inner().state
    }

    /// Run the job's request logic on the current runtime.
    pub fn start(&self) -> Result<(), JobError> {
        let runtime = Handle::try_current().map_err(|_| JobError::NoRuntime)?;
        {
            let mut inner = self.inner();
            if inner.failed || inner.state != JobState::Created {
                return Err(self.violation(inner, "start"));
            }
            inner.state = JobState::Started;
        }

        debug!("Job started");
        let job = self.clone();
        runtime.spawn(async move {
            let request = Arc::clone(&job.shared.request);
            request.do_start(&job).await;
        });
        Ok(())
    }

    /// Store the reply, mark the job finished and notify observers.
    ///
    /// With auto-delete on, the job's state is released after the last
    /// observer has returned.
    pub fn emit_finished(&self, reply: Reply) -> Result<(), JobError> {
        let observers = {
            let mut inner = self.inner();
            if inner.failed || inner.state != JobState::Started {
                return Err(self.violation(inner, "emit_finished"));
            }
            inner.state = JobState::Finished;
            inner.reply = Some(reply);
            std::mem::take(&mut inner.observers)
        };

        debug!(observers = observers.len(), "Job finished");
        for observer in observers {
            observer(self);
        }
        self.shared.finished.send_replace(true);

        if self.auto_delete() {
            self.dispose();
        }
        Ok(())
    }

    fn dispose(&self) {
        let mut inner = self.inner();
        inner.reply = None;
        inner.request_headers = Headers::new();
        inner.observers.clear();
        self.shared.disposed.store(true, Ordering::SeqCst);
    }

    /// Register `observer` to run once when the job finishes. Runs at once
    /// if the job already has; never runs on a failed job.
    pub fn on_finished<F>(&self, observer: F)
    where
        F: FnOnce(&Job) + Send + 'static,
    {
        {
            let mut inner = self.inner();
            if inner.failed {
                return;
            }
            if inner.state != JobState::Finished {
                inner.observers.push(Box::new(observer));
                return;
            }
        }
        observer(self);
    }

    /// Wait until the job has finished and its observers have run. A job
    /// that failed before finishing never completes this.
    pub async fn finished(&self) {
        let mut rx = self.shared.finished.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn set_auto_delete(&self, enable: bool) {
        self.shared.auto_delete.store(enable, Ordering::SeqCst);
    }

    pub fn auto_delete(&self) -> bool {
        self.shared.auto_delete.load(Ordering::SeqCst)
    }

    /// Whether a contract violation has killed the job.
    pub fn is_failed(&self) -> bool {
        self.inner().failed
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn set_request_headers(&self, headers: Headers) {
        self.inner().request_headers = headers;
    }

    pub fn request_headers(&self) -> Headers {
        self.inner().request_headers.clone()
    }

    /// The reply once finished; empty before that and after disposal.
    pub fn reply(&self) -> Reply {
        self.inner().reply.clone().unwrap_or_default()
    }

    pub fn reply_headers(&self) -> Headers {
        self.inner()
            .reply
            .as_ref()
            .map(|r| r.headers().clone())
            .unwrap_or_default()
    }

    pub fn is_fault(&self) -> bool {
        self.inner().reply.as_ref().is_some_and(Reply::is_fault)
    }

    pub fn fault_as_string(&self) -> String {
        self.inner()
            .reply
            .as_ref()
            .map(Reply::fault_as_string)
            .unwrap_or_default()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("state", &self.state())
            .field("auto_delete", &self.auto_delete())
            .field("disposed", &self.is_disposed())
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Job issuing a single method call, sending the job's request headers.
pub struct CallJob {
    client: ClientInterface,
    method: String,
    args: Vec<Value>,
}

impl CallJob {
    pub fn new(client: ClientInterface, method: impl Into<String>, args: Vec<Value>) -> Self {
        CallJob {
            client,
            method: method.into(),
            args,
        }
    }

    pub fn into_job(self) -> Job {
        Job::new(self)
    }
}

#[async_trait]
impl JobRequest for CallJob {
    async fn do_start(&self, job: &Job) {
        let reply = self
            .client
            .call_with_headers(&self.method, self.args.clone(), job.request_headers())
            .await;
        // Already logged by the job.
        let _ = job.emit_finished(reply);
    }
}
