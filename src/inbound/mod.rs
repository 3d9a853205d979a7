//! Inbound path: envelope inspection and the frame-scheduled message queue.

pub mod filter;
pub mod queue;

pub use filter::{extract_apply_frame, message_targets_node};
pub use queue::{InboundQueue, InboundStats, QueuedInbound};
