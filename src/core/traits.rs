//! Traits connecting the bridge to its host application.
//!
//! The bridge is transport-agnostic: the host supplies a [`Transport`] that
//! moves text frames, a [`MessageProcessor`] that consumes dispatched inbound
//! messages, and optionally a [`TargetRegistry`] when routing through
//! [`crate::bridge::ActionRouter`].

use std::time::Duration;

use serde_json::Value;

/// A text-frame transport driven by the bridge.
///
/// Implementations wrap whatever socket the host uses. The bridge calls
/// [`open`](Transport::open) and [`close`](Transport::close); the host wires
/// the socket's lifecycle events back into
/// [`crate::bridge::Bridge::on_transport_connected`] and friends.
pub trait Transport: Send {
    /// Begin connecting to `url`. Completion is reported asynchronously by
    /// the host through the bridge's transport event methods.
    fn open(&mut self, url: &str);

    /// Send one text frame. Returns `false` if the frame could not be
    /// handed to the socket.
    fn send(&mut self, text: &str) -> bool;

    /// Tear down the socket, if any.
    fn close(&mut self);
}

/// Consumer of inbound messages dispatched on their apply frame.
pub trait MessageProcessor: Send {
    /// Handle one dispatched message. `parsed` is present when the envelope
    /// was valid JSON.
    fn process(&mut self, raw: &str, parsed: Option<&Value>);
}

/// Host-side registry of addressable targets and their actions.
pub trait TargetRegistry: Send {
    /// Whether `target_id` is registered.
    fn contains(&self, target_id: &str) -> bool;

    /// Invoke an action on a target. Returns `false` when the target or
    /// action is unknown.
    fn take_action(&mut self, target_id: &str, action_id: &str, data: &Value) -> bool;
}

/// Observer invoked once per control tick with the elapsed wall time since
/// the previous tick.
pub trait TickObserver: Send {
    /// Called at the end of every control tick.
    fn on_tick(&mut self, delta: Duration);
}
