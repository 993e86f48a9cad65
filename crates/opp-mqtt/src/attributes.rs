//! JSON attribute payload handling
//!
//! The `json_attributes_topic` sidecar carries a JSON dictionary of extra
//! state attributes. Payloads that are not a dictionary are skipped with a
//! warning; the previously held attributes stay in place.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::template::ValueTemplate;

/// Parse an attribute payload, applying the template first when present.
///
/// Returns `None` when the payload is unusable; callers keep their
/// current attributes in that case.
pub fn parse_json_attributes(
    payload: &str,
    template: Option<&ValueTemplate>,
) -> Option<HashMap<String, Value>> {
    let rendered = match template {
        Some(template) => match template.render(payload) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(error = %err, "Error rendering JSON attributes template");
                return None;
            }
        },
        None => payload.to_string(),
    };

    match serde_json::from_str::<Value>(&rendered) {
        Ok(Value::Object(map)) => Some(map.into_iter().collect()),
        Ok(_) => {
            warn!(payload = %rendered, "JSON attributes payload is not a dictionary");
            None
        }
        Err(err) => {
            warn!(error = %err, "Erroneous JSON attributes payload");
            None
        }
    }
}
