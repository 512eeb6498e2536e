//! High-level Forward client API.
//!
//! `FluentClient` owns the send queue, the ack tracker and the managed
//! socket. `emit` validates and enqueues one event and returns a handle
//! settled exactly once with the event's final outcome; flushing frames
//! queued entries into chunks and drives them through the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rmpv::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::error::{ConfigError, DropReason, EmitError, ForwardError};
use crate::core::{DEFAULT_ACK_TIMEOUT, DEFAULT_CHUNK_MAX_LENGTH, DEFAULT_CHUNK_MAX_SIZE,
    DEFAULT_FLUSH_INTERVAL};
use crate::event::ack::{generate_chunk_id, AckTracker};
use crate::event::handle::{settlement, EmitHandle};
use crate::event::queue::{FlushHint, PushOutcome, QueueLimits, SendQueue};
use crate::event::retry::{run_with_retry, RetryOptions};
use crate::protocol::time::EventTime;
use crate::protocol::{build_chunk, encode_frame, Entry, EventMode};
use crate::transport::socket::{ManagedSocket, SocketConfig, SocketEvent};

/// Acknowledgement options; presence enables ack tracking.
#[derive(Debug, Clone)]
pub struct AckOptions {
    /// How long to wait for a chunk's ack before failing its events.
    pub timeout: Duration,
}

impl Default for AckOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Timestamp accepted by [`FluentClient::emit_at`].
#[derive(Debug, Clone, Copy, Default)]
pub enum Timestamp {
    /// Use the current wall-clock time.
    #[default]
    Now,
    /// Epoch seconds, or epoch milliseconds when the client's
    /// `milliseconds` option is set.
    Unix(u64),
    /// An explicit event time; passed through unchanged.
    Time(EventTime),
    /// A wall-clock instant.
    System(SystemTime),
}

impl From<EventTime> for Timestamp {
    fn from(time: EventTime) -> Self {
        Self::Time(time)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self::System(time)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self::Unix(value)
    }
}

/// Client configuration. Build through [`ClientBuilder`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Constant prefix prepended to every event tag.
    pub tag_prefix: String,
    /// Wire framing mode.
    pub event_mode: EventMode,
    /// Treat numeric timestamps as milliseconds.
    pub milliseconds: bool,
    /// Ack tracking; `None` disables it.
    pub ack: Option<AckOptions>,
    /// Delay before a queued event is flushed; zero flushes on the next
    /// scheduler turn.
    pub flush_interval: Duration,
    /// Send-queue limits.
    pub limits: QueueLimits,
    /// Chunk-send retry policy; `None` surfaces write errors directly.
    pub event_retry: Option<RetryOptions>,
    /// Whether `disconnect` waits for the queue to drain first.
    pub wait_for_pending: bool,
    /// Maximum entries per chunk.
    pub chunk_max_length: usize,
    /// Maximum estimated bytes per packed chunk.
    pub chunk_max_size: usize,
    /// Managed-socket options (address, backoff, security).
    pub socket: SocketConfig,
}

/// Builder for [`ClientConfig`] and [`FluentClient`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start a builder for the given tag prefix.
    pub fn new(tag_prefix: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                tag_prefix: tag_prefix.into(),
                event_mode: EventMode::default(),
                milliseconds: false,
                ack: None,
                flush_interval: DEFAULT_FLUSH_INTERVAL,
                limits: QueueLimits::default(),
                event_retry: None,
                wait_for_pending: false,
                chunk_max_length: DEFAULT_CHUNK_MAX_LENGTH,
                chunk_max_size: DEFAULT_CHUNK_MAX_SIZE,
                socket: SocketConfig::default(),
            },
        }
    }

    /// Collector host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.socket.host = host.into();
        self
    }

    /// Collector port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.socket.port = port;
        self
    }

    /// Wire framing mode.
    pub fn event_mode(mut self, mode: EventMode) -> Self {
        self.config.event_mode = mode;
        self
    }

    /// Treat numeric timestamps as milliseconds.
    pub fn milliseconds(mut self, enabled: bool) -> Self {
        self.config.milliseconds = enabled;
        self
    }

    /// Enable ack tracking.
    pub fn ack(mut self, options: AckOptions) -> Self {
        self.config.ack = Some(options);
        self
    }

    /// Delay before a queued event is flushed.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Send-queue limits.
    pub fn limits(mut self, limits: QueueLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Enable the chunk-send retry policy.
    pub fn event_retry(mut self, options: RetryOptions) -> Self {
        self.config.event_retry = Some(options);
        self
    }

    /// Make `disconnect` wait for the queue to drain.
    pub fn wait_for_pending(mut self, wait: bool) -> Self {
        self.config.wait_for_pending = wait;
        self
    }

    /// Reconnect backoff parameters.
    pub fn backoff(mut self, backoff: crate::transport::BackoffConfig) -> Self {
        self.config.socket.backoff = backoff;
        self
    }

    /// Timeout for a single connect attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket.connect_timeout = timeout;
        self
    }

    /// Handshake credentials.
    pub fn security(mut self, security: crate::transport::ClientSecurity) -> Self {
        self.config.socket.security = Some(security);
        self
    }

    /// Replace the socket options wholesale.
    pub fn socket(mut self, socket: SocketConfig) -> Self {
        self.config.socket = socket;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        validate_tag_prefix(&self.config.tag_prefix)?;
        if self.config.chunk_max_length == 0 {
            return Err(ConfigError::InvalidOption {
                name: "chunk_max_length",
                reason: "must be at least 1".into(),
            });
        }
        Ok(self.config)
    }

    /// Validate the configuration and start a client.
    pub fn connect(self) -> Result<FluentClient, ForwardError> {
        Ok(FluentClient::connect(self.build()?))
    }
}

fn validate_tag_prefix(prefix: &str) -> Result<(), ConfigError> {
    let valid = !prefix.is_empty()
        && prefix.is_ascii()
        && prefix.split('.').all(|segment| !segment.is_empty());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTagPrefix(prefix.to_string()))
    }
}

struct ClientInner {
    tag_prefix: String,
    event_mode: EventMode,
    milliseconds: bool,
    ack: Option<AckOptions>,
    flush_interval: Duration,
    event_retry: Option<RetryOptions>,
    wait_for_pending: bool,
    chunk_max_length: usize,
    chunk_max_size: usize,

    socket: ManagedSocket,
    queue: Mutex<SendQueue>,
    tracker: Mutex<AckTracker>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    flush_gate: tokio::sync::Mutex<()>,
    queue_drained: Notify,
    shutting_down: AtomicBool,
}

/// A Forward protocol client.
pub struct FluentClient {
    inner: Arc<ClientInner>,
    event_task: JoinHandle<()>,
    expiry_task: Option<JoinHandle<()>>,
}

impl FluentClient {
    /// Start a client; the socket connects in the background.
    pub fn connect(config: ClientConfig) -> Self {
        let socket = ManagedSocket::connect(config.socket);
        let events = socket.subscribe();

        let inner = Arc::new(ClientInner {
            tag_prefix: config.tag_prefix,
            event_mode: config.event_mode,
            milliseconds: config.milliseconds,
            ack: config.ack,
            flush_interval: config.flush_interval,
            event_retry: config.event_retry,
            wait_for_pending: config.wait_for_pending,
            chunk_max_length: config.chunk_max_length,
            chunk_max_size: config.chunk_max_size,
            socket,
            queue: Mutex::new(SendQueue::new(config.limits)),
            tracker: Mutex::new(AckTracker::new()),
            flush_timer: Mutex::new(None),
            flush_gate: tokio::sync::Mutex::new(()),
            queue_drained: Notify::new(),
            shutting_down: AtomicBool::new(false),
        });

        let event_task = tokio::spawn(run_event_loop(Arc::clone(&inner), events));
        let expiry_task = inner.ack.as_ref().map(|ack| {
            let tick = (ack.timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
            tokio::spawn(run_ack_expiry(Arc::clone(&inner), tick))
        });

        Self {
            inner,
            event_task,
            expiry_task,
        }
    }

    /// Emit one event with the current wall-clock time.
    ///
    /// `suffix` extends the tag prefix (`prefix.suffix`); an empty suffix
    /// uses the prefix alone. The record must be a map.
    pub async fn emit(&self, suffix: &str, record: Value) -> EmitHandle {
        self.emit_at(suffix, record, Timestamp::Now).await
    }

    /// Emit one event with an explicit timestamp.
    pub async fn emit_at(&self, suffix: &str, record: Value, timestamp: Timestamp) -> EmitHandle {
        let (settle, handle) = settlement();

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            settle.reject(EmitError::Dropped(DropReason::Shutdown));
            return handle;
        }
        if !matches!(record, Value::Map(_)) {
            settle.reject(EmitError::DataType(format!(
                "record must be a map, got {record}"
            )));
            return handle;
        }
        let time = match self.inner.resolve_timestamp(timestamp) {
            Ok(time) => time,
            Err(err) => {
                settle.reject(err);
                return handle;
            }
        };

        let tag = if suffix.is_empty() {
            self.inner.tag_prefix.clone()
        } else {
            format!("{}.{suffix}", self.inner.tag_prefix)
        };

        let writable = self.inner.socket.is_writable();
        let outcome =
            self.inner
                .queue
                .lock()
                .unwrap()
                .push(tag, Entry::new(time, record), settle, writable);

        match outcome {
            PushOutcome::Rejected => {}
            PushOutcome::Queued(FlushHint::Scheduled) => ClientInner::schedule_flush(&self.inner),
            PushOutcome::Queued(FlushHint::Immediate) => {
                self.inner.cancel_flush_timer();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.sync_flush().await });
            }
            PushOutcome::Queued(FlushHint::Sync) => {
                self.inner.sync_flush().await;
            }
        }
        handle
    }

    /// Schedule a flush, respecting the flush interval.
    pub fn flush(&self) {
        ClientInner::schedule_flush(&self.inner);
    }

    /// Drain the queue in-line until it is empty or the socket refuses
    /// more bytes.
    pub async fn sync_flush(&self) {
        self.inner.sync_flush().await;
    }

    /// Gracefully close the client.
    ///
    /// With `wait_for_pending` configured, waits until the queue is empty;
    /// then performs a final flush and closes the socket.
    pub async fn disconnect(&self) {
        if self.inner.wait_for_pending {
            loop {
                let drained = self.inner.queue_drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();
                if !self.inner.queue.lock().unwrap().has_pending() {
                    break;
                }
                drained.await;
            }
        }
        self.inner.sync_flush().await;
        self.inner.socket.close().await;
    }

    /// Shut down immediately.
    ///
    /// Cancels the flush timer, rejects every queued event, fails every
    /// in-flight ack, then closes the socket.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.cancel_flush_timer();
        self.inner.queue.lock().unwrap().drop_all(DropReason::Shutdown);
        self.inner.queue_drained.notify_waiters();
        self.inner.tracker.lock().unwrap().cancel_all(EmitError::AckShutdown);
        self.inner.socket.close().await;
    }

    /// Subscribe to socket events (connected, writable, ack, error, end).
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.inner.socket.subscribe()
    }

    /// Whether the socket currently accepts writes.
    pub fn is_writable(&self) -> bool {
        self.inner.socket.is_writable()
    }

    /// Entries currently queued.
    pub fn queue_length(&self) -> usize {
        self.inner.queue.lock().unwrap().total_length()
    }

    /// Estimated bytes currently queued.
    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().unwrap().total_size()
    }

    /// Chunks awaiting acknowledgement.
    pub fn pending_acks(&self) -> usize {
        self.inner.tracker.lock().unwrap().pending_count()
    }
}

impl Drop for FluentClient {
    fn drop(&mut self) {
        self.event_task.abort();
        if let Some(task) = &self.expiry_task {
            task.abort();
        }
        self.inner.cancel_flush_timer();
    }
}

impl ClientInner {
    fn resolve_timestamp(&self, timestamp: Timestamp) -> Result<EventTime, EmitError> {
        match timestamp {
            Timestamp::Now => Ok(EventTime::now()),
            Timestamp::Unix(value) => {
                if self.milliseconds {
                    EventTime::from_millis(value)
                } else {
                    EventTime::from_seconds(value)
                }
            }
            // An explicit event time bypasses the milliseconds rule.
            Timestamp::Time(time) => Ok(time),
            Timestamp::System(time) => EventTime::from_system_time(time),
        }
    }

    fn schedule_flush(inner: &Arc<Self>) {
        let mut timer = inner.flush_timer.lock().unwrap();
        if timer.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = Arc::clone(inner);
        *timer = Some(tokio::spawn(async move {
            if inner.flush_interval > Duration::ZERO {
                tokio::time::sleep(inner.flush_interval).await;
            } else {
                tokio::task::yield_now().await;
            }
            // Deregister before flushing so the flush cannot cancel itself.
            inner.flush_timer.lock().unwrap().take();
            inner.sync_flush().await;
        }));
    }

    fn cancel_flush_timer(&self) {
        if let Some(task) = self.flush_timer.lock().unwrap().take() {
            task.abort();
        }
    }

    fn notify_if_drained(&self) {
        if !self.queue.lock().unwrap().has_pending() {
            self.queue_drained.notify_waiters();
        }
    }

    /// Single-flight flush loop.
    async fn sync_flush(&self) {
        let _gate = self.flush_gate.lock().await;
        self.cancel_flush_timer();

        while self.socket.is_writable() {
            let popped = self.queue.lock().unwrap().pop_chunk(
                self.event_mode,
                self.chunk_max_size,
                self.chunk_max_length,
            );
            let Some(chunk) = popped else { break };
            self.notify_if_drained();

            let chunk_id = self.ack.as_ref().map(|_| generate_chunk_id());
            let entries = chunk.entries();
            let frame = build_chunk(self.event_mode, &chunk.tag, &entries, chunk_id.as_deref())
                .and_then(|value| encode_frame(&value));
            let bytes = match frame {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(tag = %chunk.tag, %err, "failed to encode chunk");
                    let reason = EmitError::DataType(err.to_string());
                    for settlement in chunk.into_settlements() {
                        settlement.reject(reason.clone());
                    }
                    continue;
                }
            };

            debug!(
                tag = %chunk.tag,
                entries = chunk.len(),
                bytes = bytes.len(),
                chunk_id = chunk_id.as_deref().unwrap_or(""),
                "writing chunk"
            );
            let write_result = match &self.event_retry {
                Some(options) => {
                    run_with_retry(options, || self.socket.write(bytes.clone())).await
                }
                None => self.socket.write(bytes.clone()).await,
            };

            match write_result {
                Ok(()) => match (&self.ack, chunk_id) {
                    (Some(ack), Some(id)) => {
                        let deadline = Instant::now() + ack.timeout;
                        let tag = chunk.tag.clone();
                        self.tracker.lock().unwrap().register(
                            id,
                            tag,
                            chunk.into_settlements(),
                            deadline,
                        );
                    }
                    _ => {
                        for settlement in chunk.into_settlements() {
                            settlement.deliver();
                        }
                    }
                },
                Err(err) => {
                    warn!(tag = %chunk.tag, %err, "chunk write failed");
                    match err {
                        crate::core::error::WriteError::Transport(_) => {
                            for settlement in chunk.into_settlements() {
                                settlement.reject(EmitError::Write(err.clone()));
                            }
                        }
                        // The socket went away between the writability
                        // check and the write: the entries survive for the
                        // flush that follows the reconnect.
                        _ => self.queue.lock().unwrap().push_front_chunk(chunk),
                    }
                    break;
                }
            }
        }
        self.notify_if_drained();
    }
}

async fn run_event_loop(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Writable => {
                let flusher = Arc::clone(&inner);
                tokio::spawn(async move { flusher.sync_flush().await });
            }
            SocketEvent::Ack(chunk_id) => {
                inner.tracker.lock().unwrap().resolve(&chunk_id);
            }
            SocketEvent::Error(_) | SocketEvent::End => {
                inner
                    .tracker
                    .lock()
                    .unwrap()
                    .cancel_all(EmitError::AckShutdown);
            }
            SocketEvent::Connected => {}
        }
    }
}

async fn run_ack_expiry(inner: Arc<ClientInner>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        let expired = inner.tracker.lock().unwrap().expire_due(Instant::now());
        if expired > 0 {
            debug!(expired, "expired in-flight chunks");
        }
    }
}
