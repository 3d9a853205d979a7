//! Bridge configuration.
//!
//! All tuning lives here. [`BridgeConfig::default`] reproduces the stock
//! behavior; [`BridgeConfig::builder`] covers the common overrides. Node
//! identity can also come from the environment via
//! [`InboundPolicy::from_env`].

use std::time::Duration;

use crate::core::constants;
use crate::core::error::BridgeError;

/// Environment variable naming this node.
pub const ENV_NODE_ID: &str = "LUXBRIDGE_NODE_ID";

/// Environment variable naming the authority node.
pub const ENV_AUTHORITY_NODE: &str = "LUXBRIDGE_AUTHORITY_NODE";

/// Admission policy for the inbound frame-scheduled queue.
#[derive(Debug, Clone)]
pub struct InboundPolicy {
    /// Queue capacity. Older entries are evicted from the head when full.
    pub max_queue_length: usize,

    /// Frames of lead for messages without an explicit apply frame. Values
    /// below 1 are treated as 1.
    pub lead_frames: i64,

    /// Drop messages whose explicit apply frame does not equal the current
    /// frame at admission time.
    pub require_exact_frame: bool,

    /// Gate replicated messages on holding authority.
    pub authority_only: bool,

    /// Identity of this node. Empty disables target filtering.
    pub node_id: String,

    /// Identity of the authority node.
    pub authority_node_id: String,

    /// Due messages dispatched per tick; the remainder carries over.
    pub max_messages_per_tick: usize,
}

impl Default for InboundPolicy {
    fn default() -> Self {
        Self {
            max_queue_length: constants::DEFAULT_MAX_INBOUND_QUEUE,
            lead_frames: constants::DEFAULT_LEAD_FRAMES,
            require_exact_frame: false,
            authority_only: true,
            node_id: constants::DEFAULT_AUTHORITY_NODE.to_string(),
            authority_node_id: constants::DEFAULT_AUTHORITY_NODE.to_string(),
            max_messages_per_tick: constants::DEFAULT_MAX_MESSAGES_PER_TICK,
        }
    }
}

impl InboundPolicy {
    /// Build a policy taking node identity from `LUXBRIDGE_NODE_ID` and
    /// `LUXBRIDGE_AUTHORITY_NODE`, falling back to defaults. A node with no
    /// configured identity assumes the authority identity.
    pub fn from_env() -> Self {
        let authority_node_id = std::env::var(ENV_AUTHORITY_NODE)
            .unwrap_or_else(|_| constants::DEFAULT_AUTHORITY_NODE.to_string());
        let node_id = std::env::var(ENV_NODE_ID).unwrap_or_else(|_| authority_node_id.clone());
        Self {
            node_id,
            authority_node_id,
            ..Self::default()
        }
    }

    /// Whether this node holds authority. Identity comparison is
    /// case-insensitive.
    pub fn is_authority(&self) -> bool {
        self.node_id.eq_ignore_ascii_case(&self.authority_node_id)
    }
}

/// Tuning for the outbound rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Sustained message rate in messages per second.
    pub max_messages_per_second: f32,

    /// Message token bucket capacity.
    pub max_burst_size: u32,

    /// Enforce the byte budget in addition to the message budget.
    pub enable_bytes_rate_limiting: bool,

    /// Sustained byte rate in bytes per second.
    pub max_bytes_per_second: usize,

    /// Byte token bucket capacity.
    pub max_burst_bytes: usize,

    /// Queue capacity. See [`crate::outbound::RateLimiter::enqueue`] for the
    /// overflow policy.
    pub max_queue_length: usize,

    /// Lifetime of queued non-critical messages.
    pub message_timeout: Duration,

    /// Replace queued payloads sharing a coalesce key instead of appending.
    pub enable_coalescing: bool,

    /// Fold eligible messages into batch envelopes.
    pub enable_batching: bool,

    /// Messages per batch envelope.
    pub max_batch_messages: usize,

    /// Estimated batch payload bytes before a forced flush.
    pub max_batch_bytes: usize,

    /// Oldest a batch may grow before a forced flush.
    pub max_batch_interval: Duration,

    /// Send critical messages individually, never batched.
    pub critical_bypass_batching: bool,

    /// Critical messages ignore server backoff windows.
    pub critical_bypass_backoff: bool,

    /// Sample out normal and low priority messages under queue pressure.
    pub enable_downsampling: bool,

    /// Keep one in this many low-priority messages while downsampling.
    pub low_priority_sample_rate: u32,

    /// Keep one in this many normal-priority messages while downsampling.
    pub normal_priority_sample_rate: u32,

    /// Queue fill fraction above which downsampling engages.
    pub queue_pressure_threshold: f32,

    /// Adapt the effective rate to observed backpressure.
    pub enable_adaptive_rate: bool,

    /// Multiplicative rate recovery per adjustment interval.
    pub rate_increase_factor: f32,

    /// Multiplicative rate cut on sustained backpressure.
    pub rate_decrease_factor: f32,

    /// Floor on the adaptive rate multiplier.
    pub min_rate_fraction: f32,

    /// Interval between adaptive rate adjustments.
    pub rate_adjustment_interval: Duration,

    /// First server-demanded backoff window when none is given.
    pub initial_backoff: Duration,

    /// Backoff window ceiling.
    pub max_backoff: Duration,

    /// Growth factor between consecutive backoff windows.
    pub backoff_multiplier: f32,

    /// Jitter applied to backoff windows, as a percentage.
    pub backoff_jitter_percent: f32,

    /// Log enqueue rejections and backoff transitions.
    pub log_rate_limit_events: bool,

    /// Log per-batch flush details.
    pub log_batch_details: bool,

    /// Interval between periodic metrics summary log lines.
    pub metrics_log_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_messages_per_second: constants::DEFAULT_MAX_MESSAGES_PER_SECOND,
            max_burst_size: constants::DEFAULT_MAX_BURST_SIZE,
            enable_bytes_rate_limiting: true,
            max_bytes_per_second: constants::DEFAULT_MAX_BYTES_PER_SECOND,
            max_burst_bytes: constants::DEFAULT_MAX_BURST_BYTES,
            max_queue_length: constants::DEFAULT_MAX_OUTBOUND_QUEUE,
            message_timeout: constants::DEFAULT_MESSAGE_TIMEOUT,
            enable_coalescing: true,
            enable_batching: true,
            max_batch_messages: constants::DEFAULT_MAX_BATCH_MESSAGES,
            max_batch_bytes: constants::DEFAULT_MAX_BATCH_BYTES,
            max_batch_interval: constants::DEFAULT_MAX_BATCH_INTERVAL,
            critical_bypass_batching: true,
            critical_bypass_backoff: false,
            enable_downsampling: true,
            low_priority_sample_rate: constants::DEFAULT_LOW_PRIORITY_SAMPLE_RATE,
            normal_priority_sample_rate: constants::DEFAULT_NORMAL_PRIORITY_SAMPLE_RATE,
            queue_pressure_threshold: constants::DEFAULT_QUEUE_PRESSURE_THRESHOLD,
            enable_adaptive_rate: true,
            rate_increase_factor: constants::DEFAULT_RATE_INCREASE_FACTOR,
            rate_decrease_factor: constants::DEFAULT_RATE_DECREASE_FACTOR,
            min_rate_fraction: constants::DEFAULT_MIN_RATE_FRACTION,
            rate_adjustment_interval: constants::DEFAULT_RATE_ADJUSTMENT_INTERVAL,
            initial_backoff: constants::DEFAULT_INITIAL_BACKOFF,
            max_backoff: constants::DEFAULT_MAX_BACKOFF,
            backoff_multiplier: constants::DEFAULT_BACKOFF_MULTIPLIER,
            backoff_jitter_percent: constants::DEFAULT_BACKOFF_JITTER_PERCENT,
            log_rate_limit_events: true,
            log_batch_details: false,
            metrics_log_interval: constants::DEFAULT_METRICS_LOG_INTERVAL,
        }
    }
}

/// Tuning for connection supervision and reconnect backoff.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Schedule reconnects after unclean closes and errors.
    pub auto_reconnect: bool,

    /// Reconnect attempts before giving up. Zero means unlimited.
    pub max_reconnect_attempts: u32,

    /// Time allowed for a connection attempt to complete.
    pub connect_timeout: Duration,

    /// First reconnect delay.
    pub initial_backoff: Duration,

    /// Reconnect delay ceiling.
    pub max_backoff: Duration,

    /// Growth factor between consecutive reconnect delays.
    pub backoff_multiplier: f32,

    /// Jitter applied to each reconnect delay, as a percentage. Zero makes
    /// delays deterministic.
    pub jitter_percent: f32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 0,
            connect_timeout: constants::DEFAULT_CONNECT_TIMEOUT,
            initial_backoff: constants::DEFAULT_INITIAL_BACKOFF,
            max_backoff: constants::DEFAULT_MAX_BACKOFF,
            backoff_multiplier: constants::DEFAULT_BACKOFF_MULTIPLIER,
            jitter_percent: constants::DEFAULT_BACKOFF_JITTER_PERCENT,
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Server URL handed to [`crate::core::traits::Transport::open`].
    pub server_url: String,

    /// Control sync rate in ticks per second.
    pub control_sync_rate_hz: f32,

    /// Cadence of the outbound pump while the queue is non-empty.
    pub outbound_process_interval: Duration,

    /// Route outbound messages through the rate limiter. When disabled,
    /// messages go straight to the transport.
    pub enable_rate_limiting: bool,

    /// Inbound admission policy.
    pub inbound: InboundPolicy,

    /// Outbound rate limiter tuning.
    pub limiter: RateLimiterConfig,

    /// Connection supervision tuning.
    pub connection: ConnectionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            control_sync_rate_hz: constants::DEFAULT_CONTROL_SYNC_RATE_HZ,
            outbound_process_interval: constants::DEFAULT_MAX_BATCH_INTERVAL,
            enable_rate_limiting: true,
            inbound: InboundPolicy::default(),
            limiter: RateLimiterConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Start building a configuration.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Check the configuration for values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.control_sync_rate_hz <= 0.0 {
            return Err(BridgeError::Config(
                "control_sync_rate_hz must be positive".into(),
            ));
        }
        if self.inbound.max_queue_length == 0 {
            return Err(BridgeError::Config(
                "inbound max_queue_length must be at least 1".into(),
            ));
        }
        if self.inbound.max_messages_per_tick == 0 {
            return Err(BridgeError::Config(
                "max_messages_per_tick must be at least 1".into(),
            ));
        }
        if self.limiter.max_messages_per_second <= 0.0 {
            return Err(BridgeError::Config(
                "max_messages_per_second must be positive".into(),
            ));
        }
        if self.limiter.max_queue_length == 0 {
            return Err(BridgeError::Config(
                "outbound max_queue_length must be at least 1".into(),
            ));
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(BridgeError::Config(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Set the server URL.
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    /// Set the control sync rate in ticks per second.
    pub fn control_sync_rate_hz(mut self, hz: f32) -> Self {
        self.config.control_sync_rate_hz = hz;
        self
    }

    /// Set this node's identity.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.inbound.node_id = id.into();
        self
    }

    /// Set the authority node's identity.
    pub fn authority_node_id(mut self, id: impl Into<String>) -> Self {
        self.config.inbound.authority_node_id = id.into();
        self
    }

    /// Bypass the rate limiter and send directly.
    pub fn without_rate_limiting(mut self) -> Self {
        self.config.enable_rate_limiting = false;
        self
    }

    /// Replace the inbound admission policy.
    pub fn inbound(mut self, policy: InboundPolicy) -> Self {
        self.config.inbound = policy;
        self
    }

    /// Replace the rate limiter tuning.
    pub fn limiter(mut self, limiter: RateLimiterConfig) -> Self {
        self.config.limiter = limiter;
        self
    }

    /// Replace the connection supervision tuning.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<BridgeConfig, BridgeError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
