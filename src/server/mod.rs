//! Forward collector server.
//!
//! Accepts connections, runs the handshake when security is configured,
//! and dispatches every inbound batch of entries to the registered
//! handler. Acks are sent only after the handler accepted the batch.

mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::SharedKey;
use crate::core::error::{ForwardError, ServerError};
use crate::core::{DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};
use crate::protocol::Entry;

/// Server-side handshake requirements.
#[derive(Debug, Clone)]
pub struct ServerSecurity {
    /// Hostname the server binds into its PONG digest.
    pub server_hostname: String,
    /// Pre-shared key clients must prove knowledge of.
    pub shared_key: SharedKey,
    /// Username to password map; when non-empty, clients must also present
    /// valid credentials.
    pub user_dict: HashMap<String, String>,
}

impl ServerSecurity {
    /// Security with a shared key only.
    pub fn new(shared_key: impl Into<String>, server_hostname: impl Into<String>) -> Self {
        Self {
            server_hostname: server_hostname.into(),
            shared_key: SharedKey::new(shared_key),
            user_dict: HashMap::new(),
        }
    }

    /// Require user authentication for the given credentials.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_dict.insert(username.into(), password.into());
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Advertised in HELO; when false, sessions close after one batch.
    pub keepalive: bool,
    /// Handshake requirements; `None` accepts frames immediately.
    pub security: Option<ServerSecurity>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            keepalive: true,
            security: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Receiver of inbound entry batches, one call per frame.
///
/// Returning an error refuses the batch: no ack is sent and the
/// connection is closed.
pub trait EntryHandler: Send + Sync + 'static {
    /// Handle every entry of one inbound frame.
    fn on_entries(&self, tag: &str, entries: Vec<Entry>) -> Result<(), ServerError>;
}

impl<F> EntryHandler for F
where
    F: Fn(&str, Vec<Entry>) -> Result<(), ServerError> + Send + Sync + 'static,
{
    fn on_entries(&self, tag: &str, entries: Vec<Entry>) -> Result<(), ServerError> {
        self(tag, entries)
    }
}

/// A Forward collector listening for producer connections.
pub struct FluentServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl FluentServer {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        config: ServerConfig,
        handler: impl EntryHandler,
    ) -> Result<Self, ForwardError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(%local_addr, "listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            config.keepalive,
            config.security.map(Arc::new),
            config.max_connections,
            Arc::new(handler),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to finish.
    ///
    /// Established sessions run to completion on their own tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for FluentServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    keepalive: bool,
    security: Option<Arc<ServerSecurity>>,
    max_connections: usize,
    handler: Arc<dyn EntryHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let connections = Arc::new(Semaphore::new(max_connections));

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown_rx.changed() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Ok(permit) = Arc::clone(&connections).try_acquire_owned() else {
                    warn!(%peer, "connection limit reached, refusing");
                    continue;
                };
                debug!(%peer, "accepted connection");
                let security = security.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) =
                        session::run_session(stream, peer, keepalive, security, handler).await
                    {
                        warn!(%peer, %err, "session ended with error");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}
