//! The bridge service: ties the inbound queue, outbound limiter and
//! connection supervisor together under one control tick.

pub mod router;
pub mod runner;
pub mod service;

pub use router::ActionRouter;
pub use runner::{BridgeHandle, spawn};
pub use service::{Bridge, BridgeStats};
