//! Connection supervision: the reconnect state machine and its backoff
//! schedule.

pub mod manager;

pub use manager::{CloseVerdict, ConnectionManager, ConnectionState, PollEvent};
