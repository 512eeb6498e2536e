//! Handshake frames for the HELO / PING / PONG exchange.
//!
//! ```text
//! Client                                          Server
//!   |                                                |
//!   |  <-- ["HELO", {nonce, auth, keepalive}] ------ |
//!   |                                                |
//!   |  --- ["PING", hostname, salt, digest,          |
//!   |        username, password_digest] -----------> |
//!   |                                                |
//!   |  <-- ["PONG", auth_ok, reason, hostname,       |
//!   |        digest] ------------------------------- |
//!   |                                                |
//! ```
//!
//! The exchange is strict: the server speaks first, and any other frame in
//! a handshake position is a fatal error for the connection. Digest
//! construction lives in [`crate::auth`].

use rmpv::Value;

use crate::core::error::HandshakeError;

/// Server greeting opening the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helo {
    /// 16 random bytes bound into the shared-key digests.
    pub nonce: Vec<u8>,
    /// User-auth salt; empty when user authentication is not required.
    pub auth: Vec<u8>,
    /// Whether the server keeps the connection open between batches.
    pub keepalive: bool,
}

impl Helo {
    /// Encode to the wire value.
    pub fn to_value(&self) -> Value {
        let options = Value::Map(vec![
            (Value::from("nonce"), Value::Binary(self.nonce.clone())),
            (Value::from("auth"), Value::Binary(self.auth.clone())),
            (Value::from("keepalive"), Value::Boolean(self.keepalive)),
        ]);
        Value::Array(vec![Value::from("HELO"), options])
    }

    /// Parse from a decoded top-level value.
    pub fn from_value(value: &Value) -> Result<Self, HandshakeError> {
        let body = frame_body(value, "HELO")?;
        let options = body
            .first()
            .and_then(Value::as_map)
            .ok_or_else(|| HandshakeError::Malformed("HELO carries no option map".into()))?;

        let mut helo = Self {
            nonce: Vec::new(),
            auth: Vec::new(),
            keepalive: true,
        };
        for (key, val) in options {
            match key.as_str() {
                Some("nonce") => helo.nonce = value_bytes(val, "nonce")?,
                Some("auth") => helo.auth = value_bytes(val, "auth")?,
                Some("keepalive") => {
                    helo.keepalive = val.as_bool().ok_or_else(|| {
                        HandshakeError::Malformed("keepalive is not a boolean".into())
                    })?;
                }
                _ => {}
            }
        }
        Ok(helo)
    }
}

/// Client response authenticating against the HELO nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Hostname the client bound into its shared-key digest.
    pub client_hostname: String,
    /// Client-generated salt bound into both shared-key digests.
    pub shared_key_salt: Vec<u8>,
    /// hex(SHA512(salt + client_hostname + nonce + shared_key)).
    pub shared_key_hexdigest: String,
    /// Username; empty when user authentication is not required.
    pub username: String,
    /// hex(SHA512(auth_salt + username + password)); empty without user auth.
    pub password_hexdigest: String,
}

impl Ping {
    /// Encode to the wire value.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from("PING"),
            Value::from(self.client_hostname.as_str()),
            Value::Binary(self.shared_key_salt.clone()),
            Value::from(self.shared_key_hexdigest.as_str()),
            Value::from(self.username.as_str()),
            Value::from(self.password_hexdigest.as_str()),
        ])
    }

    /// Parse from a decoded top-level value.
    pub fn from_value(value: &Value) -> Result<Self, HandshakeError> {
        let body = frame_body(value, "PING")?;
        if body.len() < 5 {
            return Err(HandshakeError::Malformed(format!(
                "PING has {} fields, expected 5",
                body.len()
            )));
        }
        Ok(Self {
            client_hostname: value_str(&body[0], "client hostname")?,
            shared_key_salt: value_bytes(&body[1], "shared key salt")?,
            shared_key_hexdigest: value_str(&body[2], "shared key digest")?,
            username: value_str(&body[3], "username")?,
            password_hexdigest: value_str(&body[4], "password digest")?,
        })
    }
}

/// Server verdict closing the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// Whether authentication succeeded.
    pub auth_result: bool,
    /// Failure reason; empty on success.
    pub reason: String,
    /// Hostname the server bound into its shared-key digest.
    pub server_hostname: String,
    /// hex(SHA512(nonce + server_hostname + salt + shared_key)).
    pub shared_key_hexdigest: String,
}

impl Pong {
    /// Encode to the wire value.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from("PONG"),
            Value::Boolean(self.auth_result),
            Value::from(self.reason.as_str()),
            Value::from(self.server_hostname.as_str()),
            Value::from(self.shared_key_hexdigest.as_str()),
        ])
    }

    /// Parse from a decoded top-level value.
    pub fn from_value(value: &Value) -> Result<Self, HandshakeError> {
        let body = frame_body(value, "PONG")?;
        if body.len() < 4 {
            return Err(HandshakeError::Malformed(format!(
                "PONG has {} fields, expected 4",
                body.len()
            )));
        }
        Ok(Self {
            auth_result: body[0]
                .as_bool()
                .ok_or_else(|| HandshakeError::Malformed("auth result is not a boolean".into()))?,
            reason: value_str(&body[1], "reason")?,
            server_hostname: value_str(&body[2], "server hostname")?,
            shared_key_hexdigest: value_str(&body[3], "shared key digest")?,
        })
    }
}

/// Check the frame tag and return the fields after it.
fn frame_body<'a>(value: &'a Value, expected: &'static str) -> Result<&'a [Value], HandshakeError> {
    let frame = value.as_array().ok_or_else(|| unexpected(expected, value))?;
    match frame.split_first() {
        Some((tag, body)) if tag.as_str() == Some(expected) => Ok(body),
        _ => Err(unexpected(expected, value)),
    }
}

fn unexpected(expected: &'static str, value: &Value) -> HandshakeError {
    let got = match value {
        Value::Array(frame) => frame
            .first()
            .and_then(Value::as_str)
            .unwrap_or("non-string tag")
            .to_string(),
        other => format!("{other}"),
    };
    HandshakeError::UnexpectedFrame { expected, got }
}

/// Byte fields may arrive as binary or as strings.
fn value_bytes(value: &Value, field: &str) -> Result<Vec<u8>, HandshakeError> {
    match value {
        Value::Binary(b) => Ok(b.clone()),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(HandshakeError::Malformed(format!(
            "{field} is not a byte field"
        ))),
    }
}

fn value_str(value: &Value, field: &str) -> Result<String, HandshakeError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| HandshakeError::Malformed(format!("{field} is not a string")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helo_roundtrip() {
        let helo = Helo {
            nonce: vec![7; 16],
            auth: vec![],
            keepalive: false,
        };
        let decoded = Helo::from_value(&helo.to_value()).unwrap();
        assert_eq!(decoded, helo);
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = Ping {
            client_hostname: "client.example".into(),
            shared_key_salt: vec![1; 16],
            shared_key_hexdigest: "ab".repeat(64),
            username: String::new(),
            password_hexdigest: String::new(),
        };
        let decoded = Ping::from_value(&ping.to_value()).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn test_pong_roundtrip() {
        let pong = Pong {
            auth_result: true,
            reason: String::new(),
            server_hostname: "collector.example".into(),
            shared_key_hexdigest: "cd".repeat(64),
        };
        let decoded = Pong::from_value(&pong.to_value()).unwrap();
        assert_eq!(decoded, pong);
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let helo = Helo {
            nonce: vec![0; 16],
            auth: vec![],
            keepalive: true,
        };
        let err = Ping::from_value(&helo.to_value()).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::UnexpectedFrame {
                expected: "PING",
                ..
            }
        ));
    }

    #[test]
    fn test_short_ping_rejected() {
        let frame = Value::Array(vec![Value::from("PING"), Value::from("host")]);
        assert!(matches!(
            Ping::from_value(&frame),
            Err(HandshakeError::Malformed(_))
        ));
    }
}
