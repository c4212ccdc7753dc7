//! Server side of callwire: accepts connections and spreads them over a
//! bounded pool of worker threads, each serving its connections on a
//! single-threaded runtime.

pub mod auth;
mod connection;
pub mod logging;
pub mod pool;
pub mod server;
mod worker;

pub use auth::{Authenticator, BasicAuthenticator};
pub use logging::{init_logging, init_test_logging};
pub use pool::{select_worker, PoolConfig, PoolError, Selection, WorkerPool};
pub use server::{RpcTarget, Server, ServerConfig};
