//! Envelope inspection helpers for inbound admission.
//!
//! Peer tooling is loose about where scheduling and addressing metadata
//! lives, so both helpers probe a fixed set of spellings and nesting levels
//! instead of demanding one shape.

use serde_json::Value;

/// Field spellings accepted as an explicit apply frame.
const APPLY_FRAME_KEYS: [&str; 7] = [
    "applyFrame",
    "targetFrame",
    "frame",
    "frameNumber",
    "frameIndex",
    "target_frame",
    "apply_frame",
];

/// Field spellings accepted as a target-node filter.
const TARGET_NODE_KEYS: [&str; 3] = ["targetNodeId", "targetNodeIds", "targetIds"];

/// Interpret a JSON value as a frame number. Accepts integers, whole-valued
/// floats and numeric strings.
fn value_as_frame(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)
            }
        }
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn frame_in_object(value: &Value) -> Option<i64> {
    let obj = value.as_object()?;
    APPLY_FRAME_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(value_as_frame))
}

/// Extract an explicit apply frame from an envelope.
///
/// Probes the top level, then `data`, then `meta`, then `meta.data`. Returns
/// `None` when the envelope carries no recognizable frame hint.
pub fn extract_apply_frame(payload: &Value) -> Option<i64> {
    if let Some(frame) = frame_in_object(payload) {
        return Some(frame);
    }
    let obj = payload.as_object()?;
    if let Some(frame) = obj.get("data").and_then(frame_in_object) {
        return Some(frame);
    }
    if let Some(meta) = obj.get("meta") {
        if let Some(frame) = frame_in_object(meta) {
            return Some(frame);
        }
        if let Some(frame) = meta.get("data").and_then(frame_in_object) {
            return Some(frame);
        }
    }
    None
}

/// Whether a single filter token addresses `node_id`. `*` and `all` are
/// wildcards; comparison is case-insensitive.
fn token_matches(token: &str, node_id: &str) -> bool {
    let token = token.trim();
    token == "*" || token.eq_ignore_ascii_case("all") || token.eq_ignore_ascii_case(node_id)
}

/// Check one object level for target-node filter fields. Sets `has_filter`
/// when any recognized field is present, and returns `true` on a match.
fn object_targets_node(value: &Value, node_id: &str, has_filter: &mut bool) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    for key in TARGET_NODE_KEYS {
        match obj.get(key) {
            Some(Value::String(s)) => {
                *has_filter = true;
                if s.split([',', ';']).any(|t| token_matches(t, node_id)) {
                    return true;
                }
            }
            Some(Value::Array(items)) => {
                *has_filter = true;
                if items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|t| token_matches(t, node_id))
                {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Decide whether an envelope is addressed to `node_id`.
///
/// Filter fields are honored at the top level and inside `data`. An envelope
/// with no filter fields, a non-object envelope, or an empty local identity
/// is addressed to everyone.
pub fn message_targets_node(payload: Option<&Value>, node_id: &str) -> bool {
    if node_id.is_empty() {
        return true;
    }
    let Some(payload) = payload else {
        return true;
    };
    if !payload.is_object() {
        return true;
    }
    let mut has_filter = false;
    if object_targets_node(payload, node_id, &mut has_filter) {
        return true;
    }
    if let Some(data) = payload.get("data") {
        if object_targets_node(data, node_id, &mut has_filter) {
            return true;
        }
    }
    !has_filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod apply_frame {
        use super::*;

        #[test]
        fn top_level_integer() {
            assert_eq!(extract_apply_frame(&json!({"applyFrame": 120})), Some(120));
        }

        #[test]
        fn alternate_spellings() {
            assert_eq!(extract_apply_frame(&json!({"frameNumber": 7})), Some(7));
            assert_eq!(extract_apply_frame(&json!({"target_frame": 9})), Some(9));
        }

        #[test]
        fn nested_under_data_and_meta() {
            assert_eq!(
                extract_apply_frame(&json!({"data": {"frame": 33}})),
                Some(33)
            );
            assert_eq!(
                extract_apply_frame(&json!({"meta": {"applyFrame": 44}})),
                Some(44)
            );
            assert_eq!(
                extract_apply_frame(&json!({"meta": {"data": {"frameIndex": 55}}})),
                Some(55)
            );
        }

        #[test]
        fn numeric_string_and_float() {
            assert_eq!(extract_apply_frame(&json!({"frame": "250"})), Some(250));
            assert_eq!(extract_apply_frame(&json!({"frame": 9.0})), Some(9));
        }

        #[test]
        fn top_level_wins_over_nested() {
            let payload = json!({"applyFrame": 1, "data": {"applyFrame": 2}});
            assert_eq!(extract_apply_frame(&payload), Some(1));
        }

        #[test]
        fn absent() {
            assert_eq!(extract_apply_frame(&json!({"event": "x"})), None);
            assert_eq!(extract_apply_frame(&json!("bare string")), None);
        }
    }

    mod targeting {
        use super::*;

        #[test]
        fn no_filter_targets_everyone() {
            assert!(message_targets_node(Some(&json!({"event": "x"})), "node_3"));
            assert!(message_targets_node(None, "node_3"));
        }

        #[test]
        fn exact_match_case_insensitive() {
            let payload = json!({"targetNodeId": "Node_3"});
            assert!(message_targets_node(Some(&payload), "node_3"));
            assert!(!message_targets_node(Some(&payload), "node_4"));
        }

        #[test]
        fn wildcards() {
            assert!(message_targets_node(Some(&json!({"targetNodeId": "*"})), "n"));
            assert!(message_targets_node(
                Some(&json!({"targetNodeIds": "ALL"})),
                "n"
            ));
        }

        #[test]
        fn delimited_string_list() {
            let payload = json!({"targetNodeIds": "node_1, node_2;node_3"});
            assert!(message_targets_node(Some(&payload), "node_2"));
            assert!(message_targets_node(Some(&payload), "node_3"));
            assert!(!message_targets_node(Some(&payload), "node_9"));
        }

        #[test]
        fn array_form_under_data() {
            let payload = json!({"data": {"targetIds": ["node_a", "node_b"]}});
            assert!(message_targets_node(Some(&payload), "node_b"));
            assert!(!message_targets_node(Some(&payload), "node_c"));
        }

        #[test]
        fn empty_local_identity_admits_all() {
            let payload = json!({"targetNodeId": "node_1"});
            assert!(message_targets_node(Some(&payload), ""));
        }
    }
}
