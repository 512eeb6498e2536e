//! # fluent-forward
//!
//! Client and server for the [Fluentd Forward protocol], a
//! MessagePack-based wire protocol for shipping structured log events
//! from producers to a log aggregator.
//!
//! [Fluentd Forward protocol]: https://github.com/fluent/fluentd/wiki/Forward-Protocol-Specification-v1
//!
//! The client side provides:
//!
//! - **Backpressured emission**: a per-tag bounded queue with size/length
//!   limits, drop policy and flush triggers
//! - **Connection management**: reconnect with exponential backoff and the
//!   HELO/PING/PONG shared-key handshake
//! - **Delivery tracking**: optional per-chunk acknowledgements with
//!   timeouts; every `emit` returns a handle settled exactly once
//! - **All four event modes**: `Message`, `Forward`, `PackedForward` and
//!   `CompressedPackedForward` (gzip)
//!
//! The server side accepts producer connections, mirrors the handshake,
//! dispatches inbound entries to a handler, and acknowledges chunks.
//!
//! ## Modules
//!
//! - [`protocol`]: event time, chunk framing, handshake frames, codec
//! - [`transport`]: managed socket and reconnect backoff
//! - [`auth`]: handshake nonces and digests
//! - [`event`]: result handles, send queue, ack tracker, retry policy
//! - [`client`]: the producer-side `FluentClient`
//! - [`server`]: the collector-side `FluentServer`
//!
//! ## Example
//!
//! ```no_run
//! use fluent_forward::client::ClientBuilder;
//! use fluent_forward::ForwardError;
//! use rmpv::Value;
//!
//! # async fn example() -> Result<(), ForwardError> {
//! let client = ClientBuilder::new("app")
//!     .host("127.0.0.1")
//!     .port(24224)
//!     .connect()?;
//!
//! let handle = client
//!     .emit("access", Value::Map(vec![
//!         (Value::from("method"), Value::from("GET")),
//!         (Value::from("path"), Value::from("/index.html")),
//!     ]))
//!     .await;
//! handle.wait().await?;
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod client;
pub mod core;
pub mod event;
pub mod protocol;
pub mod server;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::SharedKey;
    pub use crate::client::{AckOptions, ClientBuilder, ClientConfig, FluentClient, Timestamp};
    pub use crate::core::error::{
        ConfigError, DropReason, EmitError, ForwardError, HandshakeError, ProtocolError,
        ServerError, SocketError, WriteError,
    };
    pub use crate::event::{EmitHandle, QueueLimits, RetryOptions, SizeLimit};
    pub use crate::protocol::{Entry, EventMode, EventTime};
    pub use crate::server::{EntryHandler, FluentServer, ServerConfig, ServerSecurity};
    pub use crate::transport::{BackoffConfig, ClientSecurity, SocketConfig, SocketEvent};
}

// Re-export commonly used items at crate root.
pub use crate::client::{ClientBuilder, FluentClient};
pub use crate::core::error::ForwardError;
pub use crate::protocol::{Entry, EventMode, EventTime};
pub use crate::server::{FluentServer, ServerConfig};
