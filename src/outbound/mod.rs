//! Outbound path: token-bucket rate limiting, prioritized queueing,
//! coalescing, batching and server-demanded backoff.

pub mod batch;
pub mod bucket;
pub mod limiter;

pub use batch::OutboundBatch;
pub use bucket::TokenBuckets;
pub use limiter::{MessageKind, Priority, RateLimiter, RateLimiterMetrics};
