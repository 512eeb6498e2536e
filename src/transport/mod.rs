//! Transport layer: managed socket and reconnect backoff.

pub mod backoff;
pub mod socket;

pub use backoff::BackoffConfig;
pub use socket::{ClientSecurity, ConnectionPhase, ManagedSocket, SocketConfig, SocketEvent};
