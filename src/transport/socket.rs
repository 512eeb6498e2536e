//! Managed TCP socket for the client side.
//!
//! Owns the connect/reconnect lifecycle, drives the handshake, and fans
//! out connection events to subscribers. Writes are serialized through the
//! driver task; a write resolves once its bytes have been flushed to the
//! transport.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Handshaking
//! Handshaking  --PONG ok--> Established
//! Handshaking  --PONG bad--> Fatal
//! Established  --error/close--> Disconnected (reconnect w/ backoff)
//! any          --close()--> Closing (terminal)
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rmpv::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::{self, SharedKey};
use crate::core::error::{HandshakeError, ProtocolError, SocketError, WriteError};
use crate::core::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};
use crate::protocol::handshake::{Helo, Ping, Pong};
use crate::protocol::{message, ForwardCodec};
use crate::transport::backoff::BackoffConfig;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No transport; a reconnect may be scheduled.
    Disconnected,
    /// Connect attempt in progress.
    Connecting,
    /// Transport open, HELO/PING/PONG in progress.
    Handshaking,
    /// Ready for writes.
    Established,
    /// Closed on request; terminal.
    Closing,
    /// Unrecoverable failure; terminal.
    Fatal,
}

/// Events observable through [`ManagedSocket::subscribe`].
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection reached the established state.
    Connected,
    /// The socket became writable after having been unwritable.
    Writable,
    /// The server acknowledged a chunk.
    Ack(String),
    /// A transport, protocol or handshake error occurred; the error is
    /// shared across subscribers.
    Error(Arc<SocketError>),
    /// The transport ended.
    End,
}

/// Client-side handshake credentials.
#[derive(Debug, Clone)]
pub struct ClientSecurity {
    /// Pre-shared key bound into the handshake digests.
    pub shared_key: SharedKey,
    /// Hostname this client binds into its PING digest.
    pub self_hostname: String,
    /// Username for user authentication; empty when not required.
    pub username: String,
    /// Password for user authentication; empty when not required.
    pub password: String,
}

impl ClientSecurity {
    /// Security with a shared key only (no user authentication).
    pub fn new(shared_key: impl Into<String>, self_hostname: impl Into<String>) -> Self {
        Self {
            shared_key: SharedKey::new(shared_key),
            self_hostname: self_hostname.into(),
            username: String::new(),
            password: String::new(),
        }
    }

    /// Add user credentials.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

/// Managed socket configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Collector hostname or address.
    pub host: String,
    /// Collector port.
    pub port: u16,
    /// Timeout for a single connect attempt and each handshake frame.
    pub connect_timeout: Duration,
    /// Reconnect backoff parameters.
    pub backoff: BackoffConfig,
    /// Handshake credentials; `None` skips the handshake exchange.
    pub security: Option<ClientSecurity>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffConfig::default(),
            security: None,
        }
    }
}

struct WriteRequest {
    bytes: Bytes,
    done: oneshot::Sender<Result<(), WriteError>>,
}

/// Fixed-event fan-out to any number of subscribers.
#[derive(Default)]
struct SignalBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SocketEvent>>>,
}

impl SignalBus {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn emit(&self, event: SocketEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct SocketShared {
    phase: Mutex<ConnectionPhase>,
    bus: SignalBus,
}

impl SocketShared {
    fn set_phase(&self, phase: ConnectionPhase) {
        let mut current = self.phase.lock().unwrap();
        if *current != phase {
            debug!(from = ?*current, to = ?phase, "socket phase change");
            *current = phase;
        }
    }

    fn phase(&self) -> ConnectionPhase {
        *self.phase.lock().unwrap()
    }

    fn emit_error(&self, error: SocketError) {
        self.bus.emit(SocketEvent::Error(Arc::new(error)));
    }
}

/// A connection-oriented socket with reconnect, handshake and event fan-out.
pub struct ManagedSocket {
    shared: Arc<SocketShared>,
    write_tx: mpsc::Sender<WriteRequest>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedSocket {
    /// Start the socket; the driver connects and reconnects in the
    /// background until [`close`](Self::close) or a fatal failure.
    pub fn connect(config: SocketConfig) -> Self {
        let shared = Arc::new(SocketShared {
            phase: Mutex::new(ConnectionPhase::Disconnected),
            bus: SignalBus::default(),
        });
        let (write_tx, write_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(run_driver(
            Arc::clone(&shared),
            config,
            write_rx,
            shutdown_rx,
        ));

        Self {
            shared,
            write_tx,
            shutdown_tx,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.shared.phase()
    }

    /// Whether a write would currently be accepted.
    pub fn is_writable(&self) -> bool {
        self.phase() == ConnectionPhase::Established
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.shared.bus.subscribe()
    }

    /// Write bytes to the transport.
    ///
    /// Accepted only in the established phase; resolves once the bytes are
    /// flushed, rejects on transport error or loss of the connection.
    pub async fn write(&self, bytes: Bytes) -> Result<(), WriteError> {
        if !self.is_writable() {
            return Err(WriteError::NotWritable);
        }
        let (done, done_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { bytes, done })
            .await
            .map_err(|_| WriteError::ConnectionClosed)?;
        done_rx.await.map_err(|_| WriteError::ConnectionClosed)?
    }

    /// Close the socket and wait for the driver to stop.
    ///
    /// Reconnects are disabled from this point on.
    pub async fn close(&self) {
        {
            let mut phase = self.shared.phase.lock().unwrap();
            if *phase != ConnectionPhase::Fatal {
                *phase = ConnectionPhase::Closing;
            }
        }
        let _ = self.shutdown_tx.send(true);
        let driver = self.driver.lock().unwrap().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

enum SessionEnd {
    /// Shutdown was requested.
    Shutdown,
    /// Unrecoverable; do not reconnect.
    Fatal(String),
    /// Connection lost; reconnect if allowed.
    Lost(String),
}

async fn run_driver(
    shared: Arc<SocketShared>,
    config: SocketConfig,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut fatal = false;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_phase(ConnectionPhase::Connecting);

        let connect = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        );
        let connected = tokio::select! {
            res = connect => Some(res),
            _ = shutdown_rx.changed() => None,
        };

        match connected {
            None => break,
            Some(Ok(Ok(stream))) => {
                match run_session(
                    &shared,
                    &config,
                    stream,
                    &mut write_rx,
                    &mut shutdown_rx,
                    &mut attempt,
                )
                .await
                {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Fatal(reason) => {
                        warn!(%reason, "socket entered fatal state");
                        fatal = true;
                        break;
                    }
                    SessionEnd::Lost(reason) => {
                        debug!(%reason, "connection lost");
                    }
                }
            }
            Some(Ok(Err(e))) => {
                warn!(host = %config.host, port = config.port, error = %e, "connect failed");
                shared.emit_error(SocketError::Connect(e.to_string()));
            }
            Some(Err(_)) => {
                warn!(host = %config.host, port = config.port, "connect timed out");
                shared.emit_error(SocketError::Connect("connect timed out".into()));
            }
        }

        // A lost or failed connection invalidates in-flight write requests.
        reject_pending_writes(&mut write_rx);

        attempt += 1;
        match config.backoff.delay(attempt) {
            None => {
                warn!(attempt, "reconnect attempts exhausted");
                shared.emit_error(SocketError::ReconnectExhausted);
                fatal = true;
                break;
            }
            Some(delay) => {
                shared.set_phase(ConnectionPhase::Disconnected);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    reject_pending_writes(&mut write_rx);
    shared.set_phase(if fatal {
        ConnectionPhase::Fatal
    } else {
        ConnectionPhase::Closing
    });
    shared.bus.emit(SocketEvent::End);
}

fn reject_pending_writes(write_rx: &mut mpsc::Receiver<WriteRequest>) {
    while let Ok(req) = write_rx.try_recv() {
        let _ = req.done.send(Err(WriteError::ConnectionClosed));
    }
}

async fn run_session(
    shared: &SocketShared,
    config: &SocketConfig,
    stream: TcpStream,
    write_rx: &mut mpsc::Receiver<WriteRequest>,
    shutdown_rx: &mut watch::Receiver<bool>,
    attempt: &mut u32,
) -> SessionEnd {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, ForwardCodec::new());

    shared.set_phase(ConnectionPhase::Handshaking);
    if let Some(security) = &config.security {
        match run_handshake(&mut framed, security, config.connect_timeout).await {
            Ok(()) => {}
            Err(HandshakeFailure::Fatal(err)) => {
                let reason = err.to_string();
                shared.emit_error(SocketError::Handshake(err));
                return SessionEnd::Fatal(reason);
            }
            Err(HandshakeFailure::Transport(err)) => {
                let reason = err.to_string();
                shared.emit_error(err);
                return SessionEnd::Lost(reason);
            }
        }
    }

    shared.set_phase(ConnectionPhase::Established);
    *attempt = 0;
    info!(host = %config.host, port = config.port, "connection established");
    shared.bus.emit(SocketEvent::Connected);
    shared.bus.emit(SocketEvent::Writable);

    loop {
        tokio::select! {
            request = write_rx.recv() => {
                let Some(WriteRequest { bytes, done }) = request else {
                    // Socket handle dropped; nothing left to serve.
                    return SessionEnd::Shutdown;
                };
                match framed.send(bytes).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        let msg = format!("write failed: {e}");
                        let _ = done.send(Err(WriteError::Transport(msg.clone())));
                        shared.emit_error(SocketError::Protocol(e));
                        return SessionEnd::Lost(msg);
                    }
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(value)) => {
                        if let Some(chunk_id) = message::parse_ack(&value) {
                            shared.bus.emit(SocketEvent::Ack(chunk_id));
                        } else {
                            let msg = format!("unexpected frame from server: {value}");
                            warn!(%msg);
                            shared.emit_error(SocketError::Protocol(
                                ProtocolError::UnexpectedMessage(msg.clone()),
                            ));
                            return SessionEnd::Lost(msg);
                        }
                    }
                    Some(Err(e)) => {
                        let msg = format!("decode failed: {e}");
                        shared.emit_error(SocketError::Protocol(e));
                        return SessionEnd::Lost(msg);
                    }
                    None => {
                        shared.bus.emit(SocketEvent::End);
                        return SessionEnd::Lost("connection closed by peer".into());
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = SinkExt::<Bytes>::close(&mut framed).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

enum HandshakeFailure {
    /// Authentication failure; reconnecting cannot help.
    Fatal(HandshakeError),
    /// Transport-level failure during the exchange.
    Transport(SocketError),
}

async fn run_handshake(
    framed: &mut Framed<TcpStream, ForwardCodec>,
    security: &ClientSecurity,
    frame_timeout: Duration,
) -> Result<(), HandshakeFailure> {
    let helo = Helo::from_value(&next_handshake_frame(framed, frame_timeout, "HELO").await?)
        .map_err(HandshakeFailure::Fatal)?;
    debug!(keepalive = helo.keepalive, "received HELO");

    let shared_key_salt = auth::generate_shared_key_salt();
    let shared_key_hexdigest = auth::ping_digest(
        &shared_key_salt,
        &security.self_hostname,
        &helo.nonce,
        &security.shared_key,
    );
    let password_hexdigest = if helo.auth.is_empty() {
        String::new()
    } else {
        auth::password_digest(&helo.auth, &security.username, &security.password)
    };
    let ping = Ping {
        client_hostname: security.self_hostname.clone(),
        shared_key_salt: shared_key_salt.clone(),
        shared_key_hexdigest,
        username: security.username.clone(),
        password_hexdigest,
    };
    framed
        .send(ping.to_value())
        .await
        .map_err(|e| HandshakeFailure::Transport(SocketError::Protocol(e)))?;

    let pong = Pong::from_value(&next_handshake_frame(framed, frame_timeout, "PONG").await?)
        .map_err(HandshakeFailure::Fatal)?;
    if !pong.auth_result {
        return Err(HandshakeFailure::Fatal(HandshakeError::Rejected(
            pong.reason,
        )));
    }

    let expected = auth::pong_digest(
        &helo.nonce,
        &pong.server_hostname,
        &shared_key_salt,
        &security.shared_key,
    );
    if !auth::verify_digest(&expected, &pong.shared_key_hexdigest) {
        return Err(HandshakeFailure::Fatal(HandshakeError::DigestMismatch));
    }

    debug!(server = %pong.server_hostname, "handshake complete");
    Ok(())
}

async fn next_handshake_frame(
    framed: &mut Framed<TcpStream, ForwardCodec>,
    frame_timeout: Duration,
    expected: &'static str,
) -> Result<Value, HandshakeFailure> {
    match tokio::time::timeout(frame_timeout, framed.next()).await {
        Ok(Some(Ok(value))) => Ok(value),
        Ok(Some(Err(e))) => Err(HandshakeFailure::Transport(SocketError::Protocol(e))),
        Ok(None) => Err(HandshakeFailure::Transport(SocketError::Protocol(
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed awaiting {expected}"),
            )),
        ))),
        Err(_) => Err(HandshakeFailure::Fatal(HandshakeError::UnexpectedFrame {
            expected,
            got: "timeout".into(),
        })),
    }
}
