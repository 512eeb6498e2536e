//! In-flight chunk acknowledgement tracking.
//!
//! After a chunk is written with an ack request, its settlements move from
//! the queue into this tracker keyed by chunk id. They leave it exactly
//! once: on ack receipt, on deadline expiry, or on cancellation when the
//! socket or client goes away.

use std::collections::HashMap;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::core::error::EmitError;
use crate::core::CHUNK_ID_SIZE;
use crate::event::handle::Settlement;

/// Generate a fresh chunk id: base64 of 128 random bits.
pub fn generate_chunk_id() -> String {
    let mut bytes = [0u8; CHUNK_ID_SIZE];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

struct InflightChunk {
    tag: String,
    settlements: Vec<Settlement>,
    deadline: Instant,
}

/// Tracker for chunks written but not yet acknowledged.
#[derive(Default)]
pub struct AckTracker {
    inflight: HashMap<String, InflightChunk>,
}

impl AckTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a written chunk awaiting its ack.
    pub fn register(
        &mut self,
        chunk_id: String,
        tag: String,
        settlements: Vec<Settlement>,
        deadline: Instant,
    ) {
        debug!(chunk = %chunk_id, %tag, entries = settlements.len(), "chunk in flight");
        self.inflight.insert(
            chunk_id,
            InflightChunk {
                tag,
                settlements,
                deadline,
            },
        );
    }

    /// Settle a chunk as delivered. Returns whether the id was in flight.
    pub fn resolve(&mut self, chunk_id: &str) -> bool {
        match self.inflight.remove(chunk_id) {
            Some(chunk) => {
                debug!(chunk = %chunk_id, tag = %chunk.tag, "chunk acknowledged");
                for settlement in chunk.settlements {
                    settlement.deliver();
                }
                true
            }
            None => false,
        }
    }

    /// Settle every chunk whose deadline has passed with `AckTimeout`.
    ///
    /// Returns the number of expired chunks.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, chunk)| chunk.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for chunk_id in &due {
            if let Some(chunk) = self.inflight.remove(chunk_id) {
                debug!(chunk = %chunk_id, tag = %chunk.tag, "ack timed out");
                for settlement in chunk.settlements {
                    settlement.reject(EmitError::AckTimeout);
                }
            }
        }
        due.len()
    }

    /// Settle every in-flight chunk with the given error.
    pub fn cancel_all(&mut self, error: EmitError) {
        for (_, chunk) in self.inflight.drain() {
            for settlement in chunk.settlements {
                settlement.reject(error.clone());
            }
        }
    }

    /// Whether any chunk is awaiting its ack.
    pub fn has_pending(&self) -> bool {
        !self.inflight.is_empty()
    }

    /// Number of chunks awaiting their ack.
    pub fn pending_count(&self) -> usize {
        self.inflight.len()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight.values().map(|chunk| chunk.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::handle::settlement;
    use std::time::Duration;

    #[test]
    fn test_chunk_id_shape() {
        let a = generate_chunk_id();
        let b = generate_chunk_id();
        assert_ne!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), CHUNK_ID_SIZE);
    }

    #[tokio::test]
    async fn test_resolve_delivers_all_settlements() {
        let mut tracker = AckTracker::new();
        let (s1, h1) = settlement();
        let (s2, h2) = settlement();
        tracker.register(
            "c1".into(),
            "t".into(),
            vec![s1, s2],
            Instant::now() + Duration::from_secs(60),
        );
        assert!(tracker.has_pending());

        assert!(tracker.resolve("c1"));
        assert!(!tracker.has_pending());
        assert_eq!(h1.wait().await, Ok(()));
        assert_eq!(h2.wait().await, Ok(()));

        assert!(!tracker.resolve("c1"));
    }

    #[tokio::test]
    async fn test_expire_due_rejects_with_ack_timeout() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();
        let (s1, h1) = settlement();
        let (s2, h2) = settlement();
        tracker.register("old".into(), "t".into(), vec![s1], now);
        tracker.register(
            "fresh".into(),
            "t".into(),
            vec![s2],
            now + Duration::from_secs(60),
        );

        assert_eq!(tracker.expire_due(now + Duration::from_millis(1)), 1);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(h1.wait().await, Err(EmitError::AckTimeout));

        tracker.resolve("fresh");
        assert_eq!(h2.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut tracker = AckTracker::new();
        let (s1, h1) = settlement();
        tracker.register(
            "c1".into(),
            "t".into(),
            vec![s1],
            Instant::now() + Duration::from_secs(60),
        );

        tracker.cancel_all(EmitError::AckShutdown);
        assert!(!tracker.has_pending());
        assert_eq!(h1.wait().await, Err(EmitError::AckShutdown));
    }

    #[test]
    fn test_next_deadline() {
        let mut tracker = AckTracker::new();
        assert!(tracker.next_deadline().is_none());

        let now = Instant::now();
        let (s1, _h1) = settlement();
        let (s2, _h2) = settlement();
        tracker.register("a".into(), "t".into(), vec![s1], now + Duration::from_secs(5));
        tracker.register("b".into(), "t".into(), vec![s2], now + Duration::from_secs(1));
        assert_eq!(tracker.next_deadline(), Some(now + Duration::from_secs(1)));
    }
}
