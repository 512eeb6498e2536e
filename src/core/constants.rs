//! Protocol constants for the Fluentd Forward protocol.
//!
//! The wire-level values are fixed by the protocol and MUST NOT be changed.
//! The defaults are tunable through the client/server configuration.

use std::time::Duration;

// =============================================================================
// WIRE CONSTANTS
// =============================================================================

/// Default Fluentd Forward port, for both listening and connecting.
pub const DEFAULT_PORT: u16 = 24224;

/// MessagePack extension type code carrying an event time.
pub const EVENT_TIME_EXT_TYPE: i8 = 0;

/// Size in bytes of an encoded event time (u32 seconds + u32 nanos).
pub const EVENT_TIME_SIZE: usize = 8;

/// Size in bytes of the handshake nonce sent in HELO.
pub const NONCE_SIZE: usize = 16;

/// Size in bytes of the user-authentication salt sent in HELO.
pub const AUTH_SALT_SIZE: usize = 16;

/// Size in bytes of a chunk identifier before base64 encoding.
pub const CHUNK_ID_SIZE: usize = 16;

/// Value of the `compressed` option for gzip-compressed packed chunks.
pub const COMPRESSED_GZIP: &str = "gzip";

// =============================================================================
// DECODER LIMITS
// =============================================================================

/// Maximum accepted size of a single top-level frame (32 MiB).
///
/// Inputs claiming more than this abort the connection before allocation.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Maximum accepted size of a decompressed packed payload (128 MiB).
pub const MAX_DECOMPRESSED_SIZE: usize = 128 * 1024 * 1024;

// =============================================================================
// CLIENT DEFAULTS
// =============================================================================

/// Default timeout for a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before a queued event is flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Default time to wait for a chunk acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(190);

/// Default initial reconnect backoff.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Default maximum reconnect backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default backoff multiplier applied after each failed attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default random jitter factor applied to each backoff delay.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;

/// Default maximum entries popped into one chunk.
pub const DEFAULT_CHUNK_MAX_LENGTH: usize = 1000;

/// Default maximum estimated bytes popped into one packed chunk.
pub const DEFAULT_CHUNK_MAX_SIZE: usize = 2 * 1024 * 1024;

// =============================================================================
// SERVER DEFAULTS
// =============================================================================

/// Default maximum concurrent server connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
