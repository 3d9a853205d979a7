//! Routes dispatched inbound messages to a target registry.

use log::{debug, warn};
use serde_json::Value;

use crate::core::traits::{MessageProcessor, TargetRegistry};

/// Event name carrying a target action invocation.
pub const TARGET_ACTION_EVENT: &str = "target:action";

/// A [`MessageProcessor`] that routes `target:action` envelopes to a
/// [`TargetRegistry`].
///
/// Expected shape:
///
/// ```json
/// {"event": "target:action", "data": {"targetId": "t", "actionId": "a", "data": {}}}
/// ```
///
/// Envelopes with other events, or without valid JSON, are ignored with a
/// debug log line.
pub struct ActionRouter<R: TargetRegistry> {
    registry: R,
}

impl<R: TargetRegistry> ActionRouter<R> {
    /// Route into `registry`.
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    /// The wrapped registry.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    fn route(&mut self, payload: &Value) {
        let Some(data) = payload.get("data") else {
            debug!("action envelope missing data field");
            return;
        };
        let (Some(target_id), Some(action_id)) = (
            data.get("targetId").and_then(Value::as_str),
            data.get("actionId").and_then(Value::as_str),
        ) else {
            debug!("action envelope missing targetId or actionId");
            return;
        };
        let action_data = data.get("data").unwrap_or(&Value::Null);
        if !self.registry.take_action(target_id, action_id, action_data) {
            warn!("unknown target or action: {target_id}:{action_id}");
        }
    }
}

impl<R: TargetRegistry> MessageProcessor for ActionRouter<R> {
    fn process(&mut self, _raw: &str, parsed: Option<&Value>) {
        let Some(payload) = parsed else {
            debug!("ignoring non-JSON inbound message");
            return;
        };
        match payload.get("event").and_then(Value::as_str) {
            Some(TARGET_ACTION_EVENT) => self.route(payload),
            Some(event) => debug!("ignoring unhandled event: {event}"),
            None => debug!("ignoring inbound message without event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct FakeRegistry {
        invocations: Vec<(String, String)>,
    }

    impl TargetRegistry for FakeRegistry {
        fn contains(&self, target_id: &str) -> bool {
            target_id == "lamp"
        }

        fn take_action(&mut self, target_id: &str, action_id: &str, _data: &Value) -> bool {
            if !self.contains(target_id) {
                return false;
            }
            self.invocations
                .push((target_id.to_string(), action_id.to_string()));
            true
        }
    }

    #[test]
    fn routes_action_to_registry() {
        let mut router = ActionRouter::new(FakeRegistry::default());
        let payload = json!({
            "event": TARGET_ACTION_EVENT,
            "data": {"targetId": "lamp", "actionId": "setIntensity", "data": {"value": 0.5}},
        });
        router.process("", Some(&payload));
        assert_eq!(
            router.registry().invocations,
            vec![("lamp".to_string(), "setIntensity".to_string())]
        );
    }

    #[test]
    fn ignores_other_events_and_bad_shapes() {
        let mut router = ActionRouter::new(FakeRegistry::default());
        router.process("", Some(&json!({"event": "heartbeat"})));
        router.process("", Some(&json!({"event": TARGET_ACTION_EVENT})));
        router.process("not json", None);
        assert!(router.registry().invocations.is_empty());
    }

    #[test]
    fn unknown_target_is_reported_not_invoked() {
        let mut router = ActionRouter::new(FakeRegistry::default());
        let payload = json!({
            "event": TARGET_ACTION_EVENT,
            "data": {"targetId": "ghost", "actionId": "noop"},
        });
        router.process("", Some(&payload));
        assert!(router.registry().invocations.is_empty());
    }
}
