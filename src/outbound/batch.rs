//! Accumulator for outbound batch envelopes.

use std::time::Instant;

use serde_json::{Value, json};

use crate::core::config::RateLimiterConfig;
use crate::core::constants::BATCH_EVENT;

/// Payloads accumulated toward one batch envelope.
///
/// The limiter decides when to add and when to flush; the batch only tracks
/// its own contents, estimated size and age.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    entries: Vec<Value>,
    bytes: usize,
    started_at: Option<Instant>,
}

impl OutboundBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one payload with its estimated serialized size.
    pub fn push(&mut self, payload: Value, estimated_bytes: usize, now: Instant) {
        if self.entries.is_empty() {
            self.started_at = Some(now);
        }
        self.bytes += estimated_bytes;
        self.entries.push(payload);
    }

    /// Payloads currently accumulated.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated serialized size of the accumulated payloads.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether `estimated_bytes` more would overflow the byte limit.
    pub fn would_overflow(&self, config: &RateLimiterConfig, estimated_bytes: usize) -> bool {
        !self.entries.is_empty() && self.bytes + estimated_bytes > config.max_batch_bytes
    }

    /// Whether the batch is due to flush: full by count, full by bytes, or
    /// older than the batch interval.
    pub fn should_flush(&self, config: &RateLimiterConfig, now: Instant) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self.entries.len() >= config.max_batch_messages {
            return true;
        }
        if self.bytes >= config.max_batch_bytes {
            return true;
        }
        match self.started_at {
            Some(started) => now.duration_since(started) >= config.max_batch_interval,
            None => false,
        }
    }

    /// Serialize and clear the batch.
    ///
    /// A single payload is sent bare; multiple payloads are wrapped in a
    /// batch envelope with the accumulated payloads under `data`. Returns
    /// `None` when empty.
    pub fn take_encoded(&mut self) -> Option<String> {
        let encoded = match self.entries.len() {
            0 => return None,
            1 => serde_json::to_string(&self.entries[0]).ok()?,
            _ => serde_json::to_string(&json!({
                "event": BATCH_EVENT,
                "data": std::mem::take(&mut self.entries),
            }))
            .ok()?,
        };
        self.entries.clear();
        self.bytes = 0;
        self.started_at = None;
        Some(encoded)
    }

    /// Discard accumulated payloads.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_entry_encodes_bare() {
        let mut batch = OutboundBatch::new();
        batch.push(json!({"event": "solo"}), 30, Instant::now());
        let encoded = batch.take_encoded().unwrap();
        assert_eq!(encoded, r#"{"event":"solo"}"#);
        assert!(batch.is_empty());
    }

    #[test]
    fn multiple_entries_wrap_in_envelope() {
        let mut batch = OutboundBatch::new();
        let now = Instant::now();
        batch.push(json!({"n": 1}), 20, now);
        batch.push(json!({"n": 2}), 20, now);
        let encoded = batch.take_encoded().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["event"], BATCH_EVENT);
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn flush_triggers() {
        let config = RateLimiterConfig::default();
        let mut batch = OutboundBatch::new();
        let now = Instant::now();
        assert!(!batch.should_flush(&config, now));

        batch.push(json!({}), 20, now);
        assert!(!batch.should_flush(&config, now));
        assert!(batch.should_flush(&config, now + config.max_batch_interval));

        for _ in 1..config.max_batch_messages {
            batch.push(json!({}), 20, now);
        }
        assert!(batch.should_flush(&config, now));
    }

    #[test]
    fn byte_overflow_detection() {
        let config = RateLimiterConfig {
            max_batch_bytes: 100,
            ..RateLimiterConfig::default()
        };
        let mut batch = OutboundBatch::new();
        assert!(!batch.would_overflow(&config, 1000));
        batch.push(json!({}), 60, Instant::now());
        assert!(batch.would_overflow(&config, 60));
        assert!(!batch.would_overflow(&config, 30));
    }
}
