//! Error types for the bridge.

use thiserror::Error;

/// Reasons a message was dropped instead of dispatched.
///
/// Drops are policy outcomes, not failures, so they surface through counters
/// and log lines rather than `Result` values. The cause names the policy that
/// fired.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropCause {
    /// Inbound message addressed to a different node.
    #[error("addressed to a different node")]
    TargetFiltered,

    /// Inbound replicated message received while not holding authority.
    #[error("rejected by authority gate")]
    AuthorityFiltered,

    /// Inbound message missed its exact apply frame.
    #[error("missed its exact apply frame")]
    StaleExactFrame,

    /// Oldest inbound message evicted to admit a newer one.
    #[error("evicted from a full inbound queue")]
    CapacityEvicted,

    /// Outbound message exceeded its queue lifetime.
    #[error("expired in the outbound queue")]
    Expired,

    /// Outbound queue full and no lower-priority victim available.
    #[error("rejected by a full outbound queue")]
    QueueFull,

    /// Outbound message sampled out under queue pressure.
    #[error("downsampled under queue pressure")]
    Downsampled,
}

/// Top-level bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
