//! Client side of callwire.
//!
//! A [`ClientInterface`] issues calls in three styles: `async_call` returns
//! a [`PendingCall`] at once, `call(..).await` waits for the [`Reply`], and
//! `blocking_call` blocks a plain thread. Completion can be observed with a
//! [`PendingCallWatcher`], or a call can be wrapped in a [`Job`].

pub mod auth;
pub mod client;
pub mod job;
pub mod pending;
pub mod reply;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{Authentication, BasicAuthentication};
pub use client::{ClientConfig, ClientInterface};
pub use job::{CallJob, Job, JobError, JobRequest, JobState};
pub use pending::PendingCall;
pub use reply::{CallError, Reply};
pub use watcher::PendingCallWatcher;

pub use callwire_core::{Credentials, Fault, FaultCode, Headers};
