//! Transport layer for callwire: the [`Transport`] operation trait, the
//! length-prefixed [`FrameCodec`] and a TCP implementation.

pub mod frame_codec;
pub mod tcp;
pub mod transport;

pub use frame_codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use tcp::TcpTransport;
pub use transport::{Transport, TransportError};
