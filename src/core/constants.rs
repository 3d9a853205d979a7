//! Default tuning values for the bridge.
//!
//! These are starting points, not protocol requirements. Every one of them
//! can be overridden through [`crate::core::config`].

use std::time::Duration;

// =============================================================================
// CONTROL TICK
// =============================================================================

/// Control sync rate in ticks per second.
pub const DEFAULT_CONTROL_SYNC_RATE_HZ: f32 = 60.0;

/// Inbound messages dispatched per tick before the rest carry over.
pub const DEFAULT_MAX_MESSAGES_PER_TICK: usize = 64;

// =============================================================================
// INBOUND QUEUE
// =============================================================================

/// Maximum queued inbound messages before head eviction.
pub const DEFAULT_MAX_INBOUND_QUEUE: usize = 500;

/// Frames of scheduling lead applied to messages without an explicit frame.
pub const DEFAULT_LEAD_FRAMES: i64 = 1;

/// Consumed head prefix that triggers queue compaction, whichever of this and
/// half the active length is larger.
pub const COMPACT_MIN_HEAD: usize = 256;

/// Authority node identity assumed when none is configured.
pub const DEFAULT_AUTHORITY_NODE: &str = "node_0";

// =============================================================================
// OUTBOUND RATE LIMITING
// =============================================================================

/// Sustained outbound message rate.
pub const DEFAULT_MAX_MESSAGES_PER_SECOND: f32 = 50.0;

/// Message token bucket capacity.
pub const DEFAULT_MAX_BURST_SIZE: u32 = 20;

/// Sustained outbound byte rate (1 MiB/s).
pub const DEFAULT_MAX_BYTES_PER_SECOND: usize = 1024 * 1024;

/// Byte token bucket capacity (256 KiB).
pub const DEFAULT_MAX_BURST_BYTES: usize = 256 * 1024;

/// Maximum queued outbound messages.
pub const DEFAULT_MAX_OUTBOUND_QUEUE: usize = 500;

/// Queued non-critical messages older than this are dropped.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages folded into a single batch envelope.
pub const DEFAULT_MAX_BATCH_MESSAGES: usize = 10;

/// Estimated batch payload bytes before a forced flush (64 KiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 64 * 1024;

/// Oldest a batch may grow before a forced flush.
pub const DEFAULT_MAX_BATCH_INTERVAL: Duration = Duration::from_millis(16);

/// Event name of the multi-message batch envelope.
pub const BATCH_EVENT: &str = "bridge:batch";

/// Keep one in this many low-priority messages under queue pressure.
pub const DEFAULT_LOW_PRIORITY_SAMPLE_RATE: u32 = 5;

/// Keep one in this many normal-priority messages under queue pressure.
pub const DEFAULT_NORMAL_PRIORITY_SAMPLE_RATE: u32 = 2;

/// Queue fill fraction above which downsampling engages.
pub const DEFAULT_QUEUE_PRESSURE_THRESHOLD: f32 = 0.7;

/// Multiplicative rate recovery per adjustment interval.
pub const DEFAULT_RATE_INCREASE_FACTOR: f32 = 1.1;

/// Multiplicative rate cut on sustained backpressure.
pub const DEFAULT_RATE_DECREASE_FACTOR: f32 = 0.5;

/// Floor on the adaptive rate multiplier.
pub const DEFAULT_MIN_RATE_FRACTION: f32 = 0.1;

/// Interval between adaptive rate adjustments.
pub const DEFAULT_RATE_ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(1);

/// Base byte cost assumed for any serialized envelope.
pub const MIN_MESSAGE_BYTES: usize = 20;

/// Window over which send/drop metrics are counted.
pub const METRICS_WINDOW: Duration = Duration::from_secs(1);

/// Age at which metric samples are discarded.
pub const METRICS_RETENTION: Duration = Duration::from_secs(2);

/// Interval between rate limiter summary log lines.
pub const DEFAULT_METRICS_LOG_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// CONNECTION SUPERVISION
// =============================================================================

/// Time allowed for a connection attempt to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnect delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Growth factor between consecutive reconnect delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Jitter applied to each reconnect delay, as a percentage.
pub const DEFAULT_BACKOFF_JITTER_PERCENT: f32 = 10.0;

/// Floor on any jittered reconnect delay.
pub const MIN_BACKOFF_DELAY: Duration = Duration::from_millis(50);

/// Minimum spacing between outbound pump passes while backing off.
pub const MIN_OUTBOUND_RESCHEDULE: Duration = Duration::from_millis(50);

/// HTTP close status indicating the peer rate limited us.
pub const CLOSE_CODE_TOO_MANY_REQUESTS: u16 = 429;

/// WebSocket policy violation close status, treated as rate limiting.
pub const CLOSE_CODE_POLICY_VIOLATION: u16 = 1008;
