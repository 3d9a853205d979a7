//! # luxbridge
//!
//! Frame-scheduled messaging for real-time show-control bridge clients.
//!
//! luxbridge sits between a host application (an engine, renderer or media
//! server) and a show-control server, and keeps traffic deterministic in
//! both directions:
//!
//! - **Inbound**: messages land in a bounded queue, get an apply frame, and
//!   are dispatched in `(apply_frame, sequence)` order by a fixed-rate
//!   control tick, after target-node and authority filtering
//! - **Outbound**: messages pass a priority-aware token-bucket rate limiter
//!   with coalescing, batching, adaptive rate control and server-demanded
//!   backoff
//! - **Connection**: a reconnect supervisor with connect timeouts and
//!   jittered exponential backoff decides when the transport reopens
//!
//! ## Modules
//!
//! - [`core`]: configuration, constants, errors and host-facing traits
//! - [`inbound`]: envelope inspection and the frame-scheduled queue
//! - [`outbound`]: the rate limiter and its token buckets and batches
//! - [`connection`]: the reconnect state machine
//! - [`bridge`]: the service tying it together, plus the tokio runner
//!
//! ## Example Usage
//!
//! ```rust
//! use luxbridge::prelude::*;
//! use serde_json::{Value, json};
//!
//! struct MyTransport;
//!
//! impl Transport for MyTransport {
//!     fn open(&mut self, _url: &str) { /* connect a websocket */ }
//!     fn send(&mut self, _text: &str) -> bool { true }
//!     fn close(&mut self) {}
//! }
//!
//! struct MyProcessor;
//!
//! impl MessageProcessor for MyProcessor {
//!     fn process(&mut self, raw: &str, _parsed: Option<&Value>) {
//!         println!("due: {raw}");
//!     }
//! }
//!
//! let config = BridgeConfig::builder()
//!     .server_url("ws://localhost:5155/myko")
//!     .build()
//!     .unwrap();
//! let mut bridge = Bridge::new(config, MyTransport, MyProcessor).unwrap();
//!
//! bridge.connect();
//! bridge.on_transport_connected();
//! bridge.queue_message(
//!     json!({"event": "pulse", "data": {"value": 0.5}}),
//!     Priority::Normal,
//!     MessageKind::EmitterPulse,
//!     Some("emitter:main"),
//! );
//! bridge.tick();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod connection;
pub mod core;
pub mod inbound;
pub mod outbound;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bridge::{ActionRouter, Bridge, BridgeHandle, BridgeStats};
    pub use crate::connection::{CloseVerdict, ConnectionManager, ConnectionState, PollEvent};
    pub use crate::core::config::{
        BridgeConfig, BridgeConfigBuilder, ConnectionConfig, InboundPolicy, RateLimiterConfig,
    };
    pub use crate::core::error::{BridgeError, DropCause};
    pub use crate::core::traits::{MessageProcessor, TargetRegistry, TickObserver, Transport};
    pub use crate::inbound::{InboundQueue, InboundStats, QueuedInbound};
    pub use crate::outbound::{MessageKind, Priority, RateLimiter, RateLimiterMetrics};
}

// Re-export commonly used items at crate root
pub use crate::bridge::{Bridge, BridgeStats};
pub use crate::connection::ConnectionState;
pub use crate::core::config::BridgeConfig;
pub use crate::core::error::BridgeError;
pub use crate::inbound::InboundQueue;
pub use crate::outbound::{MessageKind, Priority, RateLimiter};
