//! Per-connection server session.
//!
//! Mirrors the client handshake, then parses inbound chunk frames,
//! dispatches entries to the handler, and answers ack requests. Any
//! decoder error, handler error or handshake failure closes the
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth;
use crate::core::error::{HandshakeError, ServerError};
use crate::protocol::handshake::{Helo, Ping, Pong};
use crate::protocol::{build_ack, parse_chunk, ForwardCodec};
use crate::server::{EntryHandler, ServerSecurity};

pub(crate) async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    keepalive: bool,
    security: Option<Arc<ServerSecurity>>,
    handler: Arc<dyn EntryHandler>,
) -> Result<(), ServerError> {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, ForwardCodec::new());

    if let Some(security) = &security {
        run_handshake(&mut framed, peer, keepalive, security).await?;
    }
    debug!(%peer, "session active");

    while let Some(frame) = framed.next().await {
        let value = frame?;
        let chunk = parse_chunk(&value)?;
        debug!(%peer, tag = %chunk.tag, entries = chunk.entries.len(), "dispatching chunk");

        handler.on_entries(&chunk.tag, chunk.entries)?;

        // Acks confirm successful dispatch, so they go out only after the
        // handler returned without error.
        if let Some(chunk_id) = &chunk.chunk_id {
            framed.send(build_ack(chunk_id)).await?;
        }

        if !keepalive {
            debug!(%peer, "keepalive disabled, closing after batch");
            break;
        }
    }

    debug!(%peer, "session finished");
    Ok(())
}

async fn run_handshake(
    framed: &mut Framed<TcpStream, ForwardCodec>,
    peer: SocketAddr,
    keepalive: bool,
    security: &ServerSecurity,
) -> Result<(), ServerError> {
    let nonce = auth::generate_nonce();
    let auth_salt = if security.user_dict.is_empty() {
        Vec::new()
    } else {
        auth::generate_auth_salt()
    };

    let helo = Helo {
        nonce: nonce.clone(),
        auth: auth_salt.clone(),
        keepalive,
    };
    framed.send(helo.to_value()).await?;

    let frame = match framed.next().await {
        Some(frame) => frame?,
        None => {
            return Err(HandshakeError::UnexpectedFrame {
                expected: "PING",
                got: "connection closed".into(),
            }
            .into())
        }
    };
    let ping = Ping::from_value(&frame)?;

    let expected = auth::ping_digest(
        &ping.shared_key_salt,
        &ping.client_hostname,
        &nonce,
        &security.shared_key,
    );
    let shared_key_ok = auth::verify_digest(&expected, &ping.shared_key_hexdigest);

    let user_ok = if auth_salt.is_empty() {
        true
    } else {
        security
            .user_dict
            .get(&ping.username)
            .map(|password| {
                let expected = auth::password_digest(&auth_salt, &ping.username, password);
                auth::verify_digest(&expected, &ping.password_hexdigest)
            })
            .unwrap_or(false)
    };

    if !shared_key_ok || !user_ok {
        let reason = if shared_key_ok {
            "username/password mismatch"
        } else {
            "shared key mismatch"
        };
        warn!(%peer, client = %ping.client_hostname, reason, "handshake rejected");
        let pong = Pong {
            auth_result: false,
            reason: reason.to_string(),
            server_hostname: security.server_hostname.clone(),
            shared_key_hexdigest: String::new(),
        };
        framed.send(pong.to_value()).await?;
        return Err(HandshakeError::Rejected(reason.to_string()).into());
    }

    let pong = Pong {
        auth_result: true,
        reason: String::new(),
        server_hostname: security.server_hostname.clone(),
        shared_key_hexdigest: auth::pong_digest(
            &nonce,
            &security.server_hostname,
            &ping.shared_key_salt,
            &security.shared_key,
        ),
    };
    framed.send(pong.to_value()).await?;
    info!(%peer, client = %ping.client_hostname, "handshake accepted");
    Ok(())
}
