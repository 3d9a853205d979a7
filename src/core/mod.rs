//! Core types shared across the crate: configuration, constants, errors and
//! the traits that connect the bridge to its host application.

pub mod config;
pub mod constants;
pub mod error;
pub mod traits;

pub use config::{BridgeConfig, ConnectionConfig, InboundPolicy, RateLimiterConfig};
pub use error::{BridgeError, DropCause};
pub use traits::{MessageProcessor, TargetRegistry, TickObserver, Transport};
