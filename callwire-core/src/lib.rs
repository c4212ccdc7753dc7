//! Types shared by the callwire client and server: ids, headers, messages,
//! faults, credentials and the message codec.

pub mod auth;
pub mod codec;
pub mod fault;
pub mod headers;
pub mod ids;
pub mod msg;

pub use auth::{Credentials, CredentialsError};
pub use codec::{decode_message, encode_message, MessageCodecError};
pub use fault::{Fault, FaultCode};
pub use headers::{Headers, AUTHORIZATION};
pub use ids::{CallId, ConnectionId, ServerId};
pub use msg::{Message, Outcome};
