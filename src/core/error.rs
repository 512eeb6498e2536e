//! Error types for the Forward protocol client and server.

use thiserror::Error;

/// Errors raised while validating construction options.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The event mode string is not one of the four known modes.
    #[error("unknown event mode: {0:?}")]
    UnknownEventMode(String),

    /// The tag prefix is empty or not dot-separated ASCII.
    #[error("invalid tag prefix: {0:?}")]
    InvalidTagPrefix(String),

    /// A limit, timeout or backoff parameter is out of range.
    #[error("invalid option {name}: {reason}")]
    InvalidOption {
        /// Option name as spelled in the configuration.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Why an event was removed from the queue without being delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A send-queue limit rejected the event at enqueue time.
    #[error("send queue limit exceeded")]
    QueueLimit,

    /// The not-flushable limit rejected the event while the socket was
    /// unwritable.
    #[error("send queue not flushable and limit exceeded")]
    NotFlushable,

    /// The client was shut down with the event still queued.
    #[error("client shut down")]
    Shutdown,
}

/// Errors raised by a transport write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The socket was not in the established state.
    #[error("socket is not writable")]
    NotWritable,

    /// The transport reported an error before the bytes were flushed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection went away before the write completed.
    #[error("connection closed before write completed")]
    ConnectionClosed,
}

/// Errors that settle an emit result handle.
///
/// These are `Clone` because a single failure settles every handle in the
/// affected chunk.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmitError {
    /// The record or timestamp passed to `emit` is invalid.
    #[error("invalid event data: {0}")]
    DataType(String),

    /// The event was dropped by queue policy or shutdown.
    #[error("event dropped: {0}")]
    Dropped(#[from] DropReason),

    /// No acknowledgement arrived within the configured timeout.
    #[error("no ack received within the timeout")]
    AckTimeout,

    /// The socket or client closed while the chunk ack was in flight.
    #[error("connection closed while awaiting ack")]
    AckShutdown,

    /// The chunk write failed after any configured retries.
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The decoder saw a top-level value with an unknown shape.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A frame field has the wrong type or an invalid value.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A frame or payload exceeded the configured size cap.
    #[error("frame too large: {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Observed size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// A gzip payload could not be compressed or decompressed.
    #[error("compression error: {0}")]
    Compression(String),

    /// The underlying byte stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised during the HELO / PING / PONG exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// A frame other than the expected handshake frame arrived.
    #[error("expected {expected} frame, got {got}")]
    UnexpectedFrame {
        /// Name of the expected frame.
        expected: &'static str,
        /// Short description of what arrived instead.
        got: String,
    },

    /// The shared-key digest did not verify.
    #[error("shared key digest mismatch")]
    DigestMismatch,

    /// The peer rejected authentication.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// A handshake frame was structurally invalid.
    #[error("malformed handshake frame: {0}")]
    Malformed(String),
}

/// Errors surfaced by the managed socket.
///
/// Delivered through the socket's event bus as the payload of
/// `SocketEvent::Error`, one per failed connect attempt, handshake
/// failure or connection loss.
#[derive(Debug, Error)]
pub enum SocketError {
    /// A connect attempt failed or timed out.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The handshake failed; fatal for the connection.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer sent an undecodable or unexpected frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Reconnect attempts were exhausted.
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}

/// Errors raised by the collector server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    /// A connection-level protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A connection-level handshake failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The entry handler refused a batch; the connection is closed.
    #[error("entry handler failed: {0}")]
    Handler(String),

    /// I/O failure on an accepted connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type aggregating every layer.
///
/// Returned by the crate's entry points (`ClientBuilder::connect`,
/// `FluentServer::bind`); each layer error converts into it, so `?`
/// works across layers in caller code.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Emit-side error.
    #[error(transparent)]
    Emit(#[from] EmitError),

    /// Socket error.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// Server error.
    #[error(transparent)]
    Server(#[from] ServerError),
}
