//! Priority-aware outbound rate limiter.
//!
//! Messages wait in a bounded queue ordered by priority and admission order.
//! Sends are paid for from dual token buckets, folded into batch envelopes
//! when eligible, and suspended entirely while a server-demanded backoff
//! window is open. The limiter is driven from the control tick; every
//! time-dependent entry point has an `*_at` form taking an explicit
//! [`Instant`] so behavior is testable without sleeping.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::Rng;
use serde_json::Value;

use crate::core::config::RateLimiterConfig;
use crate::core::constants::{METRICS_RETENTION, METRICS_WINDOW, MIN_MESSAGE_BYTES};
use crate::core::error::DropCause;
use crate::outbound::batch::OutboundBatch;
use crate::outbound::bucket::TokenBuckets;

/// Send urgency. Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Must send: command responses, acks. Bypasses capacity limits and
    /// batching, never expires, never downsampled.
    Critical = 0,

    /// Important state changes.
    High = 1,

    /// Routine updates. Downsampled under queue pressure.
    Normal = 2,

    /// High-frequency telemetry. Downsampled aggressively under pressure.
    Low = 3,
}

impl Priority {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Coarse message category. Coalescing only folds messages of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Uncategorized traffic.
    Generic,

    /// Response to a command from the server.
    CommandResponse,

    /// Target and action registration.
    Registration,

    /// Periodic emitter value.
    EmitterPulse,

    /// Node and instance metadata.
    InstanceInfo,
}

/// Callback invoked on backoff transitions with `(backing_off,
/// window_seconds)`.
pub type StatusListener = Box<dyn Fn(bool, f32) + Send>;

/// Snapshot of limiter activity.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterMetrics {
    /// Sends in the trailing one-second window.
    pub messages_sent_last_second: u32,

    /// Bytes sent in the trailing one-second window.
    pub bytes_sent_last_second: usize,

    /// Drops in the trailing one-second window.
    pub messages_dropped_last_second: u32,

    /// Sends since construction, counting batched payloads individually.
    pub messages_sent_total: u64,

    /// Drops since construction, all causes.
    pub messages_dropped_total: u64,

    /// Payload replacements via coalescing.
    pub messages_coalesced_total: u64,

    /// Messages sampled out under queue pressure.
    pub messages_downsampled_total: u64,

    /// Messages dropped after exceeding their queue lifetime.
    pub messages_expired_total: u64,

    /// Drops by priority, indexed by `Priority as usize`.
    pub dropped_by_priority: [u64; 4],

    /// Messages queued, including the pending batch.
    pub queue_length: usize,

    /// Estimated queued bytes, including the pending batch.
    pub queue_bytes: usize,

    /// Queue fill fraction.
    pub queue_pressure: f32,

    /// Message tokens currently available.
    pub available_message_tokens: f64,

    /// Byte tokens currently available.
    pub available_byte_tokens: f64,

    /// Effective message rate after adaptive scaling.
    pub current_rate_limit: f32,

    /// Adaptive rate multiplier in `[min_rate_fraction, 1.0]`.
    pub rate_multiplier: f32,

    /// Whether a backoff window is open.
    pub backing_off: bool,

    /// Seconds left in the open backoff window.
    pub backoff_remaining_secs: f32,

    /// Consecutive backoff windows without a successful reset.
    pub backoff_count: u32,
}

#[derive(Debug)]
struct QueuedOutbound {
    payload: Value,
    priority: Priority,
    kind: MessageKind,
    coalesce_key: Option<String>,
    sequence: u64,
    queued_at: Instant,
    estimated_bytes: usize,
}

/// Token-bucket limiter with priority queueing, coalescing, batching,
/// adaptive rate control and exponential backoff.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: TokenBuckets,

    entries: Vec<QueuedOutbound>,
    /// Consumed prefix length, compacted lazily.
    head: usize,
    queue_bytes: usize,
    next_sequence: u64,

    batch: OutboundBatch,

    rate_multiplier: f32,
    last_rate_adjustment: Instant,
    backpressure_detected: bool,

    backing_off: bool,
    backoff_secs: f32,
    backoff_started: Option<Instant>,
    consecutive_backoffs: u32,

    downsample_counters: HashMap<String, u32>,

    sent_total: u64,
    dropped_total: u64,
    coalesced_total: u64,
    downsampled_total: u64,
    expired_total: u64,
    dropped_by_priority: [u64; 4],
    recent_sends: VecDeque<(Instant, usize)>,
    recent_drops: VecDeque<Instant>,
    last_metrics_log: Instant,

    status_listener: Option<StatusListener>,
}

impl RateLimiter {
    /// Create a limiter with full token buckets.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Create a limiter anchored at `now`.
    pub fn new_at(config: RateLimiterConfig, now: Instant) -> Self {
        Self {
            buckets: TokenBuckets::new(&config, now),
            config,
            entries: Vec::new(),
            head: 0,
            queue_bytes: 0,
            next_sequence: 1,
            batch: OutboundBatch::new(),
            rate_multiplier: 1.0,
            last_rate_adjustment: now,
            backpressure_detected: false,
            backing_off: false,
            backoff_secs: 0.0,
            backoff_started: None,
            consecutive_backoffs: 0,
            downsample_counters: HashMap::new(),
            sent_total: 0,
            dropped_total: 0,
            coalesced_total: 0,
            downsampled_total: 0,
            expired_total: 0,
            dropped_by_priority: [0; 4],
            recent_sends: VecDeque::new(),
            recent_drops: VecDeque::new(),
            last_metrics_log: now,
            status_listener: None,
        }
    }

    /// Swap in a new configuration at runtime.
    ///
    /// Queued messages and the pending batch are untouched; token levels
    /// are clamped so a shrunken burst capacity takes effect immediately.
    pub fn update_config(&mut self, config: RateLimiterConfig) {
        self.config = config;
        self.buckets.clamp(&self.config);
        info!(
            "rate limiter config updated: {:.1} msg/s, burst {}",
            self.config.max_messages_per_second, self.config.max_burst_size
        );
    }

    /// Register the backoff status listener. Replaces any previous listener.
    pub fn set_status_listener(&mut self, listener: StatusListener) {
        self.status_listener = Some(listener);
    }

    fn active(&self) -> usize {
        self.entries.len() - self.head
    }

    fn pressure(&self) -> f32 {
        if self.config.max_queue_length == 0 {
            return 0.0;
        }
        self.active() as f32 / self.config.max_queue_length as f32
    }

    fn count_drop(&mut self, priority: Priority, now: Instant) {
        self.dropped_total += 1;
        self.dropped_by_priority[priority.index()] += 1;
        self.recent_drops.push_back(now);
    }

    /// Estimate the serialized size of a payload without serializing it.
    fn estimate_bytes(payload: &Value) -> usize {
        let Some(obj) = payload.as_object() else {
            return MIN_MESSAGE_BYTES;
        };
        let mut estimate = MIN_MESSAGE_BYTES;
        for (key, value) in obj {
            estimate += key.len() * 2;
            estimate += match value {
                Value::String(s) => s.len() + 2,
                Value::Number(_) => 10,
                Value::Bool(_) => 5,
                Value::Object(_) => 50,
                Value::Array(_) => 50,
                Value::Null => 4,
            };
        }
        estimate
    }

    /// Queue a message for sending. See [`enqueue_at`](Self::enqueue_at).
    pub fn enqueue(
        &mut self,
        payload: Value,
        priority: Priority,
        kind: MessageKind,
        coalesce_key: Option<&str>,
    ) -> bool {
        self.enqueue_at(payload, priority, kind, coalesce_key, Instant::now())
    }

    /// Queue a message for sending.
    ///
    /// Returns `false` when the message was refused: sampled out under queue
    /// pressure, or rejected by a full queue with no lower-priority victim.
    /// A `true` return with a coalesce key may mean the payload replaced an
    /// already-queued message instead of occupying a new slot.
    pub fn enqueue_at(
        &mut self,
        payload: Value,
        priority: Priority,
        kind: MessageKind,
        coalesce_key: Option<&str>,
        now: Instant,
    ) -> bool {
        let pressure = self.pressure();

        if self.config.enable_downsampling
            && pressure >= self.config.queue_pressure_threshold
            && self.should_downsample(priority, coalesce_key)
        {
            self.downsampled_total += 1;
            trace!(
                "outbound message {}: priority {:?}, pressure {:.0}%",
                DropCause::Downsampled,
                priority,
                pressure * 100.0
            );
            return false;
        }

        if self.config.max_queue_length > 0 && self.active() >= self.config.max_queue_length {
            // Make room by dropping the newest lower-priority entry.
            let victim = (self.head..self.entries.len())
                .rev()
                .find(|&i| self.entries[i].priority > priority);
            match victim {
                Some(i) => {
                    let dropped = self.entries.remove(i);
                    self.queue_bytes -= dropped.estimated_bytes;
                    if self.config.log_rate_limit_events {
                        debug!(
                            "dropping queued {:?} message to admit {:?}",
                            dropped.priority, priority
                        );
                    }
                    self.count_drop(dropped.priority, now);
                }
                None if priority != Priority::Critical => {
                    if self.config.log_rate_limit_events {
                        debug!("outbound message {}: priority {:?}", DropCause::QueueFull, priority);
                    }
                    self.count_drop(priority, now);
                    return false;
                }
                // Critical messages are admitted past capacity.
                None => {}
            }
        }

        let estimated_bytes = Self::estimate_bytes(&payload);

        if self.config.enable_coalescing {
            if let Some(key) = coalesce_key {
                let found = (self.head..self.entries.len()).find(|&i| {
                    self.entries[i].kind == kind
                        && self.entries[i].coalesce_key.as_deref() == Some(key)
                });
                if let Some(i) = found {
                    if priority < self.entries[i].priority {
                        // More urgent replacement re-enters at its new rank.
                        let old = self.entries.remove(i);
                        self.queue_bytes -= old.estimated_bytes;
                        self.coalesced_total += 1;
                        self.insert_sorted(payload, priority, kind, Some(key), estimated_bytes, now);
                        return true;
                    }
                    trace!("coalescing outbound message with key {key}");
                    self.queue_bytes -= self.entries[i].estimated_bytes;
                    self.queue_bytes += estimated_bytes;
                    let entry = &mut self.entries[i];
                    entry.payload = payload;
                    entry.estimated_bytes = estimated_bytes;
                    entry.queued_at = now;
                    self.coalesced_total += 1;
                    return true;
                }
            }
        }

        self.insert_sorted(payload, priority, kind, coalesce_key, estimated_bytes, now);
        true
    }

    fn insert_sorted(
        &mut self,
        payload: Value,
        priority: Priority,
        kind: MessageKind,
        coalesce_key: Option<&str>,
        estimated_bytes: usize,
        now: Instant,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let entry = QueuedOutbound {
            payload,
            priority,
            kind,
            coalesce_key: coalesce_key.map(str::to_owned),
            sequence,
            queued_at: now,
            estimated_bytes,
        };
        let idx = self.entries[self.head..]
            .partition_point(|e| (e.priority, e.sequence) < (priority, sequence));
        self.entries.insert(self.head + idx, entry);
        self.queue_bytes += estimated_bytes;
    }

    /// Sample decision for one message. Keeps every Nth message per coalesce
    /// key, or per priority when the message has no key.
    fn should_downsample(&mut self, priority: Priority, coalesce_key: Option<&str>) -> bool {
        let sample_rate = match priority {
            Priority::Critical | Priority::High => return false,
            Priority::Normal => self.config.normal_priority_sample_rate,
            Priority::Low => self.config.low_priority_sample_rate,
        };
        if sample_rate <= 1 {
            return false;
        }
        let key = coalesce_key
            .map(str::to_owned)
            .unwrap_or_else(|| format!("_global_{}", priority.index()));
        let counter = self.downsample_counters.entry(key).or_insert(0);
        *counter += 1;
        if *counter >= sample_rate {
            *counter = 0;
            return false;
        }
        true
    }

    /// Process the queue, handing sendable text frames to `sink`. See
    /// [`process_queue_at`](Self::process_queue_at).
    pub fn process_queue(&mut self, sink: &mut dyn FnMut(&str)) -> usize {
        self.process_queue_at(Instant::now(), sink)
    }

    /// Process the queue at `now`, handing sendable text frames to `sink`.
    ///
    /// Returns the number of messages dispatched, counting batched payloads
    /// individually. Stops early when tokens run out or a backoff window is
    /// open.
    pub fn process_queue_at(&mut self, now: Instant, sink: &mut dyn FnMut(&str)) -> usize {
        if self.active() == 0 && self.batch.is_empty() {
            return 0;
        }

        if self.config.enable_adaptive_rate {
            self.update_adaptive_rate(now);
        }

        if self.backing_off {
            let elapsed = self
                .backoff_started
                .map(|t| now.duration_since(t).as_secs_f32())
                .unwrap_or(f32::MAX);
            if elapsed < self.backoff_secs {
                if self.config.critical_bypass_backoff {
                    return self.send_leading_critical(now, sink);
                }
                return 0;
            }
            self.reset_backoff();
        }

        self.buckets.refill(&self.config, self.rate_multiplier, now);
        self.drop_expired(now);

        if self.active() == 0 {
            if self.batch.should_flush(&self.config, now) {
                self.flush_batch(now, sink);
            }
            self.trim_metric_windows(now);
            return 0;
        }

        let mut sent = 0;
        while self.active() > 0 {
            let estimated = self.entries[self.head].estimated_bytes;
            let is_critical = self.entries[self.head].priority == Priority::Critical;

            if self.config.enable_batching && self.config.critical_bypass_batching && is_critical {
                if !self.batch.is_empty() && !self.flush_batch(now, sink) {
                    break;
                }
                if !self.buckets.can_afford(&self.config, estimated) {
                    self.backpressure_detected = true;
                    break;
                }
                self.buckets.consume(&self.config, estimated);
                if self.send_head(now, sink) {
                    sent += 1;
                }
                continue;
            }

            if !self.buckets.can_afford(&self.config, estimated) {
                if self.config.enable_batching && !self.batch.is_empty() {
                    self.flush_batch(now, sink);
                }
                self.backpressure_detected = true;
                break;
            }

            if self.config.enable_batching {
                if self.batch.would_overflow(&self.config, estimated) {
                    if !self.flush_batch(now, sink) {
                        break;
                    }
                    // Re-evaluate against fresh token state.
                    continue;
                }
                if self.batch.should_flush(&self.config, now) && !self.flush_batch(now, sink) {
                    break;
                }
                if !self.can_afford_batch_append(estimated) {
                    self.backpressure_detected = true;
                    break;
                }
                let entry = self.take_head();
                self.batch.push(entry.payload, entry.estimated_bytes, now);
                self.sent_total += 1;
                sent += 1;
            } else {
                self.buckets.consume(&self.config, estimated);
                if self.send_head(now, sink) {
                    sent += 1;
                }
            }
        }

        self.maybe_compact();

        if self.config.enable_batching && self.batch.should_flush(&self.config, now) {
            self.flush_batch(now, sink);
        }

        self.trim_metric_windows(now);

        if !self.config.metrics_log_interval.is_zero()
            && now.duration_since(self.last_metrics_log) >= self.config.metrics_log_interval
        {
            self.last_metrics_log = now;
            let m = self.metrics_at(now);
            info!(
                "outbound: {} msg/s, {} B/s, queue {} ({:.0}%), dropped {}, rate {:.1}/s",
                m.messages_sent_last_second,
                m.bytes_sent_last_second,
                m.queue_length,
                m.queue_pressure * 100.0,
                m.messages_dropped_total,
                m.current_rate_limit
            );
        }

        sent
    }

    /// During an open backoff window, send only the critical prefix.
    fn send_leading_critical(&mut self, now: Instant, sink: &mut dyn FnMut(&str)) -> usize {
        let mut sent = 0;
        while self.active() > 0 && self.entries[self.head].priority == Priority::Critical {
            let estimated = self.entries[self.head].estimated_bytes;
            if !self.buckets.can_afford(&self.config, estimated) {
                self.backpressure_detected = true;
                break;
            }
            self.buckets.consume(&self.config, estimated);
            if self.send_head(now, sink) {
                sent += 1;
            }
        }
        self.maybe_compact();
        if sent > 0 {
            debug!("sent {sent} critical messages during backoff");
        }
        sent
    }

    /// Remove and return the head entry.
    fn take_head(&mut self) -> QueuedOutbound {
        let slot = &mut self.entries[self.head];
        let entry = QueuedOutbound {
            payload: slot.payload.take(),
            priority: slot.priority,
            kind: slot.kind,
            coalesce_key: slot.coalesce_key.take(),
            sequence: slot.sequence,
            queued_at: slot.queued_at,
            estimated_bytes: slot.estimated_bytes,
        };
        self.queue_bytes -= entry.estimated_bytes;
        self.head += 1;
        entry
    }

    /// Serialize and send the head entry. Tokens are already consumed.
    fn send_head(&mut self, now: Instant, sink: &mut dyn FnMut(&str)) -> bool {
        let entry = self.take_head();
        match serde_json::to_string(&entry.payload) {
            Ok(text) => {
                sink(&text);
                self.sent_total += 1;
                self.recent_sends.push_back((now, text.len()));
                true
            }
            Err(err) => {
                warn!("failed to serialize outbound message: {err}");
                false
            }
        }
    }

    fn can_afford_batch_append(&self, estimated: usize) -> bool {
        if self.batch.is_empty() {
            return self.buckets.can_afford(&self.config, estimated);
        }
        if !self.config.enable_bytes_rate_limiting {
            return true;
        }
        (self.batch.bytes() + estimated) as f64 <= self.buckets.byte_tokens()
    }

    /// Flush the pending batch if tokens allow. A batch costs one message
    /// token plus its accumulated byte estimate.
    fn flush_batch(&mut self, now: Instant, sink: &mut dyn FnMut(&str)) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        let affordable = self.buckets.message_tokens() >= 1.0
            && (!self.config.enable_bytes_rate_limiting
                || self.buckets.byte_tokens() >= self.batch.bytes() as f64);
        if !affordable {
            self.backpressure_detected = true;
            return false;
        }
        let batch_bytes = self.batch.bytes();
        let count = self.batch.len();
        self.buckets.consume(&self.config, batch_bytes);
        if let Some(text) = self.batch.take_encoded() {
            if self.config.log_batch_details {
                debug!("sent batch: {count} messages, {} bytes", text.len());
            }
            self.recent_sends.push_back((now, text.len()));
            sink(&text);
        }
        true
    }

    /// Drop non-critical entries older than the configured lifetime.
    fn drop_expired(&mut self, now: Instant) {
        if self.config.message_timeout.is_zero() {
            return;
        }
        let mut i = self.entries.len();
        while i > self.head {
            i -= 1;
            let entry = &self.entries[i];
            if entry.priority == Priority::Critical {
                continue;
            }
            if now.duration_since(entry.queued_at) >= self.config.message_timeout {
                if self.config.log_rate_limit_events {
                    debug!(
                        "outbound message {}: priority {:?}, age {:.1}s",
                        DropCause::Expired,
                        entry.priority,
                        now.duration_since(entry.queued_at).as_secs_f32()
                    );
                }
                let dropped = self.entries.remove(i);
                self.queue_bytes -= dropped.estimated_bytes;
                self.expired_total += 1;
                self.count_drop(dropped.priority, now);
            }
        }
    }

    fn maybe_compact(&mut self) {
        use crate::core::constants::COMPACT_MIN_HEAD;
        let active = self.active();
        if active == 0 {
            self.entries.clear();
            self.head = 0;
        } else if self.head > COMPACT_MIN_HEAD.max(active / 2) {
            self.entries.drain(..self.head);
            self.head = 0;
        }
    }

    fn update_adaptive_rate(&mut self, now: Instant) {
        if now.duration_since(self.last_rate_adjustment) < self.config.rate_adjustment_interval {
            return;
        }
        let old = self.rate_multiplier;
        if self.backpressure_detected || self.backing_off {
            self.rate_multiplier =
                (self.rate_multiplier * self.config.rate_decrease_factor)
                    .max(self.config.min_rate_fraction);
            debug!(
                "adaptive rate decreased: {:.0}% -> {:.0}%",
                old * 100.0,
                self.rate_multiplier * 100.0
            );
        } else {
            self.rate_multiplier =
                (self.rate_multiplier * self.config.rate_increase_factor).min(1.0);
            if self.rate_multiplier != old {
                trace!(
                    "adaptive rate increased: {:.0}% -> {:.0}%",
                    old * 100.0,
                    self.rate_multiplier * 100.0
                );
            }
        }
        self.backpressure_detected = false;
        self.last_rate_adjustment = now;
    }

    // =========================================================================
    // BACKOFF
    // =========================================================================

    /// The server rejected us for sending too fast. Opens a backoff window of
    /// `retry_after` seconds when given, otherwise grows the previous window
    /// exponentially.
    pub fn on_rate_limit_error(&mut self, retry_after: Option<f32>) {
        self.on_rate_limit_error_at(retry_after, Instant::now());
    }

    /// See [`on_rate_limit_error`](Self::on_rate_limit_error).
    pub fn on_rate_limit_error_at(&mut self, retry_after: Option<f32>, now: Instant) {
        let window = match retry_after.filter(|s| *s > 0.0) {
            Some(secs) => secs,
            None => self.next_backoff_window(),
        };
        self.apply_backoff(window, now);
        if self.config.log_rate_limit_events {
            warn!(
                "rate limit error, backing off {:.1}s (consecutive: {})",
                self.backoff_secs, self.consecutive_backoffs
            );
        }
    }

    /// The transport failed to connect or dropped. Grows the backoff window.
    pub fn on_connection_error(&mut self) {
        self.on_connection_error_at(Instant::now());
    }

    /// See [`on_connection_error`](Self::on_connection_error).
    pub fn on_connection_error_at(&mut self, now: Instant) {
        let window = self.next_backoff_window();
        self.apply_backoff(window, now);
        debug!("connection error, backing off {:.1}s", self.backoff_secs);
    }

    /// The transport connected. Closes any open backoff window.
    pub fn on_connection_success(&mut self) {
        if self.backing_off {
            debug!("connection successful, resetting backoff");
            self.reset_backoff();
        }
    }

    fn next_backoff_window(&self) -> f32 {
        if self.backing_off {
            (self.backoff_secs * self.config.backoff_multiplier)
                .min(self.config.max_backoff.as_secs_f32())
        } else {
            self.config.initial_backoff.as_secs_f32()
        }
    }

    fn apply_backoff(&mut self, seconds: f32, now: Instant) {
        let mut seconds = seconds.max(0.0);
        let jitter_percent = self.config.backoff_jitter_percent.clamp(0.0, 100.0);
        if jitter_percent > 0.0 {
            let window = seconds * jitter_percent * 0.01;
            let min = (seconds - window).max(0.05);
            let max = (seconds + window).max(min);
            seconds = rand::thread_rng().gen_range(min..=max);
        }
        self.backing_off = true;
        self.backoff_secs = seconds;
        self.backoff_started = Some(now);
        self.consecutive_backoffs += 1;
        self.backpressure_detected = true;
        if let Some(listener) = &self.status_listener {
            listener(true, seconds);
        }
    }

    fn reset_backoff(&mut self) {
        let was_backing_off = self.backing_off;
        self.backing_off = false;
        self.backoff_secs = 0.0;
        self.backoff_started = None;
        self.consecutive_backoffs = 0;
        if was_backing_off {
            if let Some(listener) = &self.status_listener {
                listener(false, 0.0);
            }
        }
    }

    // =========================================================================
    // STATE QUERIES
    // =========================================================================

    /// Whether a backoff window is open.
    pub fn is_backing_off(&self) -> bool {
        self.backing_off
    }

    /// Time left in the open backoff window, zero when none is open.
    pub fn backoff_remaining_at(&self, now: Instant) -> Duration {
        if !self.backing_off {
            return Duration::ZERO;
        }
        let elapsed = self
            .backoff_started
            .map(|t| now.duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        Duration::from_secs_f32((self.backoff_secs - elapsed).max(0.0))
    }

    /// Messages queued, including the pending batch.
    pub fn queue_len(&self) -> usize {
        self.active() + self.batch.len()
    }

    /// Estimated queued bytes, including the pending batch.
    pub fn queue_bytes(&self) -> usize {
        self.queue_bytes + self.batch.bytes()
    }

    /// Effective message rate after adaptive scaling.
    pub fn current_rate_limit(&self) -> f32 {
        self.config.max_messages_per_second * self.rate_multiplier
    }

    /// Snapshot limiter metrics anchored at `now`.
    pub fn metrics_at(&self, now: Instant) -> RateLimiterMetrics {
        let window = |t: &Instant| now.duration_since(*t) <= METRICS_WINDOW;
        let messages_sent_last_second =
            self.recent_sends.iter().filter(|(t, _)| window(t)).count() as u32;
        let bytes_sent_last_second = self
            .recent_sends
            .iter()
            .filter(|(t, _)| window(t))
            .map(|(_, b)| *b)
            .sum();
        let messages_dropped_last_second =
            self.recent_drops.iter().filter(|t| window(t)).count() as u32;
        RateLimiterMetrics {
            messages_sent_last_second,
            bytes_sent_last_second,
            messages_dropped_last_second,
            messages_sent_total: self.sent_total,
            messages_dropped_total: self.dropped_total,
            messages_coalesced_total: self.coalesced_total,
            messages_downsampled_total: self.downsampled_total,
            messages_expired_total: self.expired_total,
            dropped_by_priority: self.dropped_by_priority,
            queue_length: self.queue_len(),
            queue_bytes: self.queue_bytes(),
            queue_pressure: self.pressure(),
            available_message_tokens: self.buckets.message_tokens(),
            available_byte_tokens: self.buckets.byte_tokens(),
            current_rate_limit: self.current_rate_limit(),
            rate_multiplier: self.rate_multiplier,
            backing_off: self.backing_off,
            backoff_remaining_secs: self.backoff_remaining_at(now).as_secs_f32(),
            backoff_count: self.consecutive_backoffs,
        }
    }

    /// Snapshot limiter metrics.
    pub fn metrics(&self) -> RateLimiterMetrics {
        self.metrics_at(Instant::now())
    }

    fn trim_metric_windows(&mut self, now: Instant) {
        while let Some((t, _)) = self.recent_sends.front() {
            if now.duration_since(*t) > METRICS_RETENTION {
                self.recent_sends.pop_front();
            } else {
                break;
            }
        }
        while let Some(t) = self.recent_drops.front() {
            if now.duration_since(*t) > METRICS_RETENTION {
                self.recent_drops.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop all queued messages and the pending batch. Counters are
    /// preserved.
    pub fn clear(&mut self) {
        let dropped = self.queue_len();
        self.entries.clear();
        self.head = 0;
        self.queue_bytes = 0;
        self.batch.clear();
        self.downsample_counters.clear();
        if dropped > 0 {
            debug!("outbound queue cleared, dropped {dropped} messages");
        }
    }

    /// Reset counters and sampling state. The queue is untouched.
    pub fn reset_stats(&mut self) {
        self.sent_total = 0;
        self.dropped_total = 0;
        self.coalesced_total = 0;
        self.downsampled_total = 0;
        self.expired_total = 0;
        self.dropped_by_priority = [0; 4];
        self.recent_sends.clear();
        self.recent_drops.clear();
        self.downsample_counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_jitter() -> RateLimiterConfig {
        RateLimiterConfig {
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        }
    }

    fn unbatched() -> RateLimiterConfig {
        RateLimiterConfig {
            enable_batching: false,
            enable_downsampling: false,
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        }
    }

    fn collect(limiter: &mut RateLimiter, now: Instant) -> (usize, Vec<String>) {
        let mut out = Vec::new();
        let sent = limiter.process_queue_at(now, &mut |text| out.push(text.to_string()));
        (sent, out)
    }

    #[test]
    fn sends_up_to_burst_then_backpressures() {
        let config = unbatched();
        let burst = config.max_burst_size as usize;
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        for i in 0..burst + 10 {
            limiter.enqueue_at(
                json!({"n": i}),
                Priority::Normal,
                MessageKind::Generic,
                None,
                now,
            );
        }
        let (sent, out) = collect(&mut limiter, now);
        assert_eq!(sent, burst);
        assert_eq!(out.len(), burst);
        assert_eq!(limiter.queue_len(), 10);
    }

    #[test]
    fn update_config_clamps_bursts_and_changes_rate() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(unbatched(), now);
        let shrunk = RateLimiterConfig {
            max_messages_per_second: 10.0,
            max_burst_size: 3,
            ..unbatched()
        };
        limiter.update_config(shrunk);
        assert_eq!(limiter.current_rate_limit(), 10.0);
        for i in 0..5 {
            limiter.enqueue_at(
                json!({"n": i}),
                Priority::Normal,
                MessageKind::Generic,
                None,
                now,
            );
        }
        // Tokens were clamped to the new burst, so only three go out.
        let (sent, _) = collect(&mut limiter, now);
        assert_eq!(sent, 3);
        assert_eq!(limiter.queue_len(), 2);
    }

    #[test]
    fn priority_orders_dispatch() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(unbatched(), now);
        limiter.enqueue_at(json!({"p": "low"}), Priority::Low, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"p": "crit"}), Priority::Critical, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"p": "high"}), Priority::High, MessageKind::Generic, None, now);
        let (_, out) = collect(&mut limiter, now);
        assert_eq!(out[0], r#"{"p":"crit"}"#);
        assert_eq!(out[1], r#"{"p":"high"}"#);
        assert_eq!(out[2], r#"{"p":"low"}"#);
    }

    #[test]
    fn coalescing_replaces_payload_idempotently() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(unbatched(), now);
        for value in 0..5 {
            limiter.enqueue_at(
                json!({"value": value}),
                Priority::Normal,
                MessageKind::EmitterPulse,
                Some("emitter:1"),
                now,
            );
        }
        assert_eq!(limiter.queue_len(), 1);
        assert_eq!(limiter.metrics().messages_coalesced_total, 4);
        let (_, out) = collect(&mut limiter, now);
        assert_eq!(out, vec![r#"{"value":4}"#.to_string()]);
    }

    #[test]
    fn coalescing_preserves_queue_position() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(unbatched(), now);
        limiter.enqueue_at(json!({"k": "a", "v": 0}), Priority::Normal, MessageKind::EmitterPulse, Some("a"), now);
        limiter.enqueue_at(json!({"k": "b"}), Priority::Normal, MessageKind::EmitterPulse, Some("b"), now);
        limiter.enqueue_at(json!({"k": "a", "v": 1}), Priority::Normal, MessageKind::EmitterPulse, Some("a"), now);
        let (_, out) = collect(&mut limiter, now);
        assert_eq!(out[0], r#"{"k":"a","v":1}"#);
        assert_eq!(out[1], r#"{"k":"b"}"#);
    }

    #[test]
    fn coalescing_respects_kind() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(unbatched(), now);
        limiter.enqueue_at(json!({"v": 1}), Priority::Normal, MessageKind::EmitterPulse, Some("x"), now);
        limiter.enqueue_at(json!({"v": 2}), Priority::Normal, MessageKind::Registration, Some("x"), now);
        assert_eq!(limiter.queue_len(), 2);
    }

    #[test]
    fn full_queue_drops_lower_priority_victim() {
        let config = RateLimiterConfig {
            max_queue_length: 2,
            ..unbatched()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        limiter.enqueue_at(json!({"v": 1}), Priority::Low, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"v": 2}), Priority::Low, MessageKind::Generic, None, now);
        assert!(limiter.enqueue_at(json!({"v": 3}), Priority::High, MessageKind::Generic, None, now));
        assert_eq!(limiter.queue_len(), 2);
        let metrics = limiter.metrics_at(now);
        assert_eq!(metrics.dropped_by_priority[Priority::Low.index()], 1);
    }

    #[test]
    fn full_queue_rejects_without_victim() {
        let config = RateLimiterConfig {
            max_queue_length: 2,
            ..unbatched()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        limiter.enqueue_at(json!({"v": 1}), Priority::Critical, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"v": 2}), Priority::Critical, MessageKind::Generic, None, now);
        assert!(!limiter.enqueue_at(json!({"v": 3}), Priority::Normal, MessageKind::Generic, None, now));
        // Critical is admitted past capacity.
        assert!(limiter.enqueue_at(json!({"v": 4}), Priority::Critical, MessageKind::Generic, None, now));
        assert_eq!(limiter.queue_len(), 3);
    }

    #[test]
    fn downsampling_keeps_one_in_n() {
        let config = RateLimiterConfig {
            queue_pressure_threshold: 0.0,
            enable_batching: false,
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        let mut kept = 0;
        for i in 0..10 {
            if limiter.enqueue_at(
                json!({"n": i}),
                Priority::Low,
                MessageKind::EmitterPulse,
                Some(format!("pulse{i}").as_str()),
                now,
            ) {
                kept += 1;
            }
        }
        // Distinct keys each start their own counter, so none reach the
        // keep threshold of 5.
        assert_eq!(kept, 0);

        let mut kept_same_key = 0;
        for i in 0..10 {
            if limiter.enqueue_at(
                json!({"n": i}),
                Priority::Low,
                MessageKind::EmitterPulse,
                Some("pulse"),
                now,
            ) {
                kept_same_key += 1;
            }
        }
        assert_eq!(kept_same_key, 2);
        assert_eq!(limiter.metrics().messages_downsampled_total, 18);
    }

    #[test]
    fn critical_and_high_never_downsampled() {
        let config = RateLimiterConfig {
            queue_pressure_threshold: 0.0,
            enable_batching: false,
            enable_coalescing: false,
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        for _ in 0..10 {
            assert!(limiter.enqueue_at(json!({}), Priority::Critical, MessageKind::Generic, Some("c"), now));
            assert!(limiter.enqueue_at(json!({}), Priority::High, MessageKind::Generic, Some("h"), now));
        }
    }

    #[test]
    fn expired_messages_dropped_but_critical_kept() {
        let config = RateLimiterConfig {
            message_timeout: Duration::from_secs(1),
            ..unbatched()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        limiter.enqueue_at(json!({"p": "n"}), Priority::Normal, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"p": "c"}), Priority::Critical, MessageKind::Generic, None, now);
        let later = now + Duration::from_secs(2);
        let (_, out) = collect(&mut limiter, later);
        assert_eq!(out, vec![r#"{"p":"c"}"#.to_string()]);
        let metrics = limiter.metrics_at(later);
        assert_eq!(metrics.messages_expired_total, 1);
    }

    #[test]
    fn backoff_blocks_processing() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(no_jitter(), now);
        limiter.enqueue_at(json!({}), Priority::Normal, MessageKind::Generic, None, now);
        limiter.on_rate_limit_error_at(Some(5.0), now);
        assert!(limiter.is_backing_off());
        assert!((limiter.backoff_remaining_at(now).as_secs_f32() - 5.0).abs() < 0.01);
        let (sent, _) = collect(&mut limiter, now + Duration::from_secs(1));
        assert_eq!(sent, 0);
        // Window elapses and processing resumes.
        let (sent, _) = collect(&mut limiter, now + Duration::from_secs(6));
        assert!(sent > 0);
        assert!(!limiter.is_backing_off());
    }

    #[test]
    fn backoff_windows_grow_exponentially() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(no_jitter(), now);
        let mut expected = 1.0f32;
        for _ in 0..4 {
            limiter.on_connection_error_at(now);
            assert!((limiter.backoff_remaining_at(now).as_secs_f32() - expected).abs() < 0.01);
            expected *= 2.0;
        }
        limiter.on_connection_success();
        assert!(!limiter.is_backing_off());
        limiter.on_connection_error_at(now);
        assert!((limiter.backoff_remaining_at(now).as_secs_f32() - 1.0).abs() < 0.01);
    }

    #[test]
    fn backoff_caps_at_maximum() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(no_jitter(), now);
        for _ in 0..20 {
            limiter.on_connection_error_at(now);
        }
        assert!(limiter.backoff_remaining_at(now).as_secs_f32() <= 60.01);
    }

    #[test]
    fn critical_bypasses_backoff_when_configured() {
        let config = RateLimiterConfig {
            critical_bypass_backoff: true,
            ..no_jitter()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        limiter.enqueue_at(json!({"p": "c"}), Priority::Critical, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"p": "n"}), Priority::Normal, MessageKind::Generic, None, now);
        limiter.on_rate_limit_error_at(Some(30.0), now);
        let (sent, out) = collect(&mut limiter, now + Duration::from_secs(1));
        assert_eq!(sent, 1);
        assert_eq!(out, vec![r#"{"p":"c"}"#.to_string()]);
        assert_eq!(limiter.queue_len(), 1);
    }

    #[test]
    fn batch_accumulates_then_flushes_on_interval() {
        let config = RateLimiterConfig {
            enable_downsampling: false,
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        };
        let interval = config.max_batch_interval;
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        for i in 0..3 {
            limiter.enqueue_at(json!({"n": i}), Priority::Normal, MessageKind::Generic, None, now);
        }
        let (sent, out) = collect(&mut limiter, now);
        assert_eq!(sent, 3);
        assert!(out.is_empty(), "batch should still be accumulating");
        assert_eq!(limiter.queue_len(), 3);

        let (_, out) = collect(&mut limiter, now + interval);
        assert_eq!(out.len(), 1);
        let value: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), 3);
        assert_eq!(limiter.queue_len(), 0);
    }

    #[test]
    fn full_batch_flushes_immediately() {
        let config = RateLimiterConfig {
            enable_downsampling: false,
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        };
        let per_batch = config.max_batch_messages;
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        for i in 0..per_batch + 2 {
            limiter.enqueue_at(json!({"n": i}), Priority::Normal, MessageKind::Generic, None, now);
        }
        let (sent, out) = collect(&mut limiter, now);
        assert_eq!(sent, per_batch + 2);
        assert_eq!(out.len(), 1);
        let value: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), per_batch);
    }

    #[test]
    fn critical_sent_solo_ahead_of_batch() {
        let config = RateLimiterConfig {
            enable_downsampling: false,
            backoff_jitter_percent: 0.0,
            ..RateLimiterConfig::default()
        };
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        limiter.enqueue_at(json!({"p": "n1"}), Priority::Normal, MessageKind::Generic, None, now);
        limiter.enqueue_at(json!({"p": "c"}), Priority::Critical, MessageKind::Generic, None, now);
        let (_, out) = collect(&mut limiter, now);
        assert_eq!(out, vec![r#"{"p":"c"}"#.to_string()]);
        // The normal message waits in the batch accumulator.
        assert_eq!(limiter.queue_len(), 1);
    }

    #[test]
    fn adaptive_rate_decreases_under_backpressure() {
        let config = unbatched();
        let adjust = config.rate_adjustment_interval;
        let burst = config.max_burst_size as usize;
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(config, now);
        for i in 0..burst * 2 {
            limiter.enqueue_at(json!({"n": i}), Priority::Normal, MessageKind::Generic, None, now);
        }
        // Exhausts the burst and records backpressure.
        collect(&mut limiter, now);
        // Next adjustment interval halves the effective rate.
        collect(&mut limiter, now + adjust + Duration::from_millis(10));
        assert!(limiter.current_rate_limit() < 50.0 * 0.6);
        let metrics = limiter.metrics();
        assert!(metrics.rate_multiplier <= 0.5);
    }

    #[test]
    fn clear_empties_queue_and_batch() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(RateLimiterConfig::default(), now);
        for i in 0..5 {
            limiter.enqueue_at(json!({"n": i}), Priority::Normal, MessageKind::Generic, None, now);
        }
        collect(&mut limiter, now);
        limiter.clear();
        assert_eq!(limiter.queue_len(), 0);
        assert_eq!(limiter.queue_bytes(), 0);
    }

    #[test]
    fn status_listener_sees_transitions() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let now = Instant::now();
        let mut limiter = RateLimiter::new_at(no_jitter(), now);
        let backing = Arc::new(AtomicBool::new(false));
        let backing_in = Arc::clone(&backing);
        limiter.set_status_listener(Box::new(move |is_backing, _secs| {
            backing_in.store(is_backing, Ordering::SeqCst);
        }));
        limiter.on_rate_limit_error_at(Some(2.0), now);
        assert!(backing.load(Ordering::SeqCst));
        limiter.on_connection_success();
        assert!(!backing.load(Ordering::SeqCst));
    }
}
