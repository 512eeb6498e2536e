//! End-to-end client/server scenarios over loopback TCP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fluent_forward::prelude::*;
use rmpv::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn rec(key: &str, val: &str) -> Value {
    Value::Map(vec![(Value::from(key), Value::from(val))])
}

type Batch = (String, Vec<Entry>);

fn capture_handler() -> (
    impl Fn(&str, Vec<Entry>) -> Result<(), ServerError> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Batch>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |tag: &str, entries: Vec<Entry>| -> Result<(), ServerError> {
        let _ = tx.send((tag.to_string(), entries));
        Ok(())
    };
    (handler, rx)
}

async fn start_server(config: ServerConfig) -> (FluentServer, mpsc::UnboundedReceiver<Batch>) {
    let (handler, rx) = capture_handler();
    let server = FluentServer::bind(config, handler).await.unwrap();
    (server, rx)
}

fn server_config_on(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: ([127, 0, 0, 1], port).into(),
        ..ServerConfig::default()
    }
}

fn quick_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: None,
    }
}

fn client_to(port: u16) -> ClientBuilder {
    ClientBuilder::new("test")
        .host("127.0.0.1")
        .port(port)
        .flush_interval(Duration::from_millis(10))
        .backoff(quick_backoff())
}

/// Bind an ephemeral port, then release it for a later listener.
async fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn recv_batch(rx: &mut mpsc::UnboundedReceiver<Batch>) -> Batch {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("server handler channel closed")
}

#[tokio::test]
async fn basic_emit_reaches_server_with_prefixed_tag() {
    init_tracing();
    let (server, mut rx) = start_server(server_config_on(0)).await;
    let client = client_to(server.local_addr().port()).connect().unwrap();

    let handle = client.emit("foo", rec("event", "foo")).await;
    assert_eq!(handle.wait().await, Ok(()));

    let (tag, entries) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.foo");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record, rec("event", "foo"));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn every_event_mode_roundtrips() {
    init_tracing();
    for mode in [
        EventMode::Message,
        EventMode::Forward,
        EventMode::PackedForward,
        EventMode::CompressedPackedForward,
    ] {
        let (server, mut rx) = start_server(server_config_on(0)).await;
        let client = client_to(server.local_addr().port())
            .event_mode(mode)
            .connect()
            .unwrap();

        let handle = client.emit("mode", rec("payload", "hello")).await;
        assert_eq!(handle.wait().await, Ok(()), "mode {mode:?}");

        let (tag, entries) = recv_batch(&mut rx).await;
        assert_eq!(tag, "test.mode");
        assert_eq!(entries[0].record, rec("payload", "hello"));

        client.disconnect().await;
        server.shutdown().await;
    }
}

#[tokio::test]
async fn queue_size_cap_rejects_oversized_then_delivers_next() {
    init_tracing();
    let port = reserve_port().await;
    // No server yet: the socket is unwritable while events are emitted.
    let client = client_to(port)
        .limits(QueueLimits {
            max: Some(SizeLimit::size(20)),
            ..QueueLimits::default()
        })
        .connect()
        .unwrap();

    let rejected = client.emit("a", rec("event", "foo bar")).await;
    assert_eq!(
        rejected.wait().await,
        Err(EmitError::Dropped(DropReason::QueueLimit))
    );

    let accepted = client.emit("b", rec("event", "lorem")).await;
    assert_eq!(client.queue_length(), 1);

    let (server, mut rx) = start_server(server_config_on(port)).await;
    assert_eq!(accepted.wait().await, Ok(()));

    let (tag, entries) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.b");
    assert_eq!(entries[0].record, rec("event", "lorem"));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn flush_interval_coalesces_into_one_frame() {
    init_tracing();
    let (server, mut rx) = start_server(server_config_on(0)).await;
    let client = client_to(server.local_addr().port())
        .flush_interval(Duration::from_millis(100))
        .connect()
        .unwrap();

    // Wait for the connection so the emits only arm the flush timer.
    let mut events = client.subscribe();
    while let Some(event) = events.recv().await {
        if matches!(event, SocketEvent::Writable) {
            break;
        }
    }

    let started = Instant::now();
    let h1 = client.emit("foo", rec("n", "1")).await;
    let h2 = client.emit("foo", rec("n", "2")).await;

    assert_eq!(h1.wait().await, Ok(()));
    assert_eq!(h2.wait().await, Ok(()));
    assert!(
        started.elapsed() >= Duration::from_millis(80),
        "flush fired before the interval elapsed"
    );

    let (_, entries) = recv_batch(&mut rx).await;
    assert_eq!(entries.len(), 2, "both events coalesced into one frame");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "exactly one flush expected"
    );

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn ack_success_settles_handle() {
    init_tracing();
    let (server, mut rx) = start_server(server_config_on(0)).await;
    let client = client_to(server.local_addr().port())
        .ack(AckOptions {
            timeout: Duration::from_secs(5),
        })
        .connect()
        .unwrap();

    let handle = client.emit("acked", rec("event", "x")).await;
    // The handle only resolves through the tracker, so delivery proves the
    // frame carried a chunk id and the server answered it.
    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(client.pending_acks(), 0);

    let (tag, _) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.acked");

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn ack_timeout_rejects_handle() {
    init_tracing();
    // A sink server that reads frames but never acknowledges.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    let client = client_to(port)
        .ack(AckOptions {
            timeout: Duration::from_millis(50),
        })
        .connect()
        .unwrap();

    let handle = client.emit("lost", rec("event", "x")).await;
    assert_eq!(handle.wait().await, Err(EmitError::AckTimeout));

    client.shutdown().await;
}

#[tokio::test]
async fn graceful_disconnect_waits_for_pending() {
    init_tracing();
    let port = reserve_port().await;
    let client = Arc::new(
        client_to(port)
            .wait_for_pending(true)
            .connect()
            .unwrap(),
    );

    // Unwritable: the event stays queued.
    let handle = client.emit("a", rec("event", "foo bar")).await;
    assert_eq!(client.queue_length(), 1);

    let disconnecting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.disconnect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !disconnecting.is_finished(),
        "disconnect must wait for the pending event"
    );

    let (server, mut rx) = start_server(server_config_on(port)).await;
    assert_eq!(handle.wait().await, Ok(()));
    disconnecting.await.unwrap();

    let (tag, _) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.a");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "exactly one final flush expected"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_pending_events() {
    init_tracing();
    let port = reserve_port().await;
    let client = client_to(port).connect().unwrap();

    let handle = client.emit("a", rec("event", "pending")).await;
    assert_eq!(client.queue_length(), 1);

    client.shutdown().await;
    assert_eq!(
        handle.wait().await,
        Err(EmitError::Dropped(DropReason::Shutdown))
    );
    assert_eq!(client.queue_length(), 0);
}

#[tokio::test]
async fn handshake_with_shared_key_and_user_auth() {
    init_tracing();
    let (handler, mut rx) = capture_handler();
    let server = FluentServer::bind(
        ServerConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            security: Some(
                ServerSecurity::new("topsecret", "collector.test").with_user("frank", "hunter2"),
            ),
            ..ServerConfig::default()
        },
        handler,
    )
    .await
    .unwrap();

    let client = client_to(server.local_addr().port())
        .security(ClientSecurity::new("topsecret", "producer.test").with_user("frank", "hunter2"))
        .connect()
        .unwrap();

    let handle = client.emit("secure", rec("event", "x")).await;
    assert_eq!(handle.wait().await, Ok(()));

    let (tag, _) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.secure");

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn handshake_shared_key_mismatch_is_fatal() {
    init_tracing();
    let (handler, _rx) = capture_handler();
    let server = FluentServer::bind(
        ServerConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            security: Some(ServerSecurity::new("server-key", "collector.test")),
            ..ServerConfig::default()
        },
        handler,
    )
    .await
    .unwrap();

    let client = client_to(server.local_addr().port())
        .security(ClientSecurity::new("client-key", "producer.test"))
        .connect()
        .unwrap();
    let mut events = client.subscribe();

    let mut saw_rejection = false;
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Error(err)
                if matches!(
                    err.as_ref(),
                    SocketError::Handshake(HandshakeError::Rejected(_))
                ) =>
            {
                saw_rejection = true;
            }
            SocketEvent::End => break,
            _ => {}
        }
    }
    assert!(saw_rejection);
    assert!(!client.is_writable());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn keepalive_disabled_still_delivers_across_batches() {
    init_tracing();
    let (handler, mut rx) = capture_handler();
    let server = FluentServer::bind(
        ServerConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            keepalive: false,
            ..ServerConfig::default()
        },
        handler,
    )
    .await
    .unwrap();
    let client = client_to(server.local_addr().port()).connect().unwrap();

    // The server closes after each batch; the client reconnects in between.
    let h1 = client.emit("one", rec("n", "1")).await;
    assert_eq!(h1.wait().await, Ok(()));
    let (tag, _) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.one");

    // Let the client observe the close before emitting again.
    while client.is_writable() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let h2 = client.emit("two", rec("n", "2")).await;
    assert_eq!(h2.wait().await, Ok(()));
    let (tag, _) = recv_batch(&mut rx).await;
    assert_eq!(tag, "test.two");

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn multiple_tags_preserve_per_tag_order() {
    init_tracing();
    let (server, mut rx) = start_server(server_config_on(0)).await;
    let client = client_to(server.local_addr().port()).connect().unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(client.emit("alpha", rec("n", &i.to_string())).await);
        handles.push(client.emit("beta", rec("n", &i.to_string())).await);
    }
    for handle in handles {
        assert_eq!(handle.wait().await, Ok(()));
    }

    let mut alpha = Vec::new();
    let mut beta = Vec::new();
    while alpha.len() + beta.len() < 10 {
        let (tag, entries) = recv_batch(&mut rx).await;
        for entry in entries {
            let n = entry.record.as_map().unwrap()[0].1.as_str().unwrap().to_string();
            match tag.as_str() {
                "test.alpha" => alpha.push(n),
                "test.beta" => beta.push(n),
                other => panic!("unexpected tag {other}"),
            }
        }
    }
    let expected: Vec<String> = (0..5).map(|i| i.to_string()).collect();
    assert_eq!(alpha, expected);
    assert_eq!(beta, expected);

    client.disconnect().await;
    server.shutdown().await;
}
