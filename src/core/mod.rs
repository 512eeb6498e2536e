//! Core constants and error types shared by every layer.

pub mod constants;
pub mod error;

pub use constants::*;
pub use error::{
    ConfigError, DropReason, EmitError, ForwardError, HandshakeError, ProtocolError, ServerError,
    SocketError, WriteError,
};
