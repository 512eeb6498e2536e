//! Handshake authentication: nonces, salts and SHA-512 digests.
//!
//! The handshake binds four byte sequences into each digest; both sides
//! compute the same concatenation and compare in constant time:
//!
//! ```text
//! ping digest     = hex(SHA512(salt ++ client_hostname ++ nonce ++ shared_key))
//! pong digest     = hex(SHA512(nonce ++ server_hostname ++ salt ++ shared_key))
//! password digest = hex(SHA512(auth_salt ++ username ++ password))
//! ```

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::core::{AUTH_SALT_SIZE, NONCE_SIZE};

/// The pre-shared key both sides bind into the handshake digests.
///
/// Zeroized on drop.
#[derive(Clone)]
pub struct SharedKey(String);

impl SharedKey {
    /// Wrap a shared key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key bytes for digest computation.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Drop for SharedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Generate the 16-byte handshake nonce.
pub fn generate_nonce() -> Vec<u8> {
    random_bytes(NONCE_SIZE)
}

/// Generate the 16-byte user-authentication salt.
pub fn generate_auth_salt() -> Vec<u8> {
    random_bytes(AUTH_SALT_SIZE)
}

/// Generate the client-side shared-key salt.
pub fn generate_shared_key_salt() -> Vec<u8> {
    random_bytes(NONCE_SIZE)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Digest sent by the client in PING.
pub fn ping_digest(salt: &[u8], client_hostname: &str, nonce: &[u8], key: &SharedKey) -> String {
    hexdigest(&[salt, client_hostname.as_bytes(), nonce, key.as_bytes()])
}

/// Digest sent by the server in PONG.
pub fn pong_digest(nonce: &[u8], server_hostname: &str, salt: &[u8], key: &SharedKey) -> String {
    hexdigest(&[nonce, server_hostname.as_bytes(), salt, key.as_bytes()])
}

/// Digest of the user credentials, salted by the HELO auth salt.
pub fn password_digest(auth_salt: &[u8], username: &str, password: &str) -> String {
    hexdigest(&[auth_salt, username.as_bytes(), password.as_bytes()])
}

/// Constant-time comparison of two hex digests.
pub fn verify_digest(expected: &str, received: &str) -> bool {
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}

fn hexdigest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_sizes_and_uniqueness() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_SIZE);
        assert_ne!(a, b);
        assert_eq!(generate_auth_salt().len(), AUTH_SALT_SIZE);
    }

    #[test]
    fn test_ping_digest_matches_both_sides() {
        let key = SharedKey::new("secret");
        let nonce = generate_nonce();
        let salt = generate_shared_key_salt();

        let client = ping_digest(&salt, "host-a", &nonce, &key);
        let server = ping_digest(&salt, "host-a", &nonce, &key);
        assert_eq!(client.len(), 128);
        assert!(verify_digest(&client, &server));
    }

    #[test]
    fn test_digest_binds_every_input() {
        let key = SharedKey::new("secret");
        let nonce = vec![1u8; NONCE_SIZE];
        let salt = vec![2u8; NONCE_SIZE];
        let base = ping_digest(&salt, "host", &nonce, &key);

        assert_ne!(base, ping_digest(&salt, "other", &nonce, &key));
        assert_ne!(base, ping_digest(&nonce, "host", &salt, &key));
        assert_ne!(
            base,
            ping_digest(&salt, "host", &nonce, &SharedKey::new("wrong"))
        );
    }

    #[test]
    fn test_pong_digest_differs_from_ping() {
        let key = SharedKey::new("secret");
        let nonce = vec![1u8; NONCE_SIZE];
        let salt = vec![2u8; NONCE_SIZE];
        assert_ne!(
            ping_digest(&salt, "host", &nonce, &key),
            pong_digest(&nonce, "host", &salt, &key)
        );
    }

    #[test]
    fn test_password_digest_empty_auth() {
        // Without user auth both sides hash empty strings; still stable.
        let a = password_digest(&[], "", "");
        let b = password_digest(&[], "", "");
        assert_eq!(a, b);
    }

    #[test]
    fn test_verify_digest_rejects_mismatch() {
        assert!(!verify_digest("aa", "ab"));
        assert!(!verify_digest("aa", "aaa"));
        assert!(verify_digest("aa", "aa"));
    }
}
