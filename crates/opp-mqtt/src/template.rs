//! Value template rendering for MQTT payloads
//!
//! Templates see the raw payload as `value` and, when the payload parses
//! as JSON, the parsed document as `value_json`.

use minijinja::{context, Environment, UndefinedBehavior};
use serde_json::Value;

use crate::error::ConfigError;

/// A compiled-on-use payload transform
#[derive(Debug, Clone)]
pub struct ValueTemplate {
    source: String,
}

impl ValueTemplate {
    /// Validate and store a template source
    pub fn new(source: impl Into<String>) -> Result<Self, ConfigError> {
        let source = source.into();
        let mut env = Environment::new();
        env.add_template("value_template", &source)?;
        Ok(Self { source })
    }

    /// Render against a raw payload.
    ///
    /// Undefined access is strict: referencing `value_json` for a payload
    /// that is not JSON, or a field the document lacks, is an error, so
    /// callers can drop the payload instead of publishing an empty state.
    pub fn render(&self, payload: &str) -> Result<String, ConfigError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template("value_template", &self.source)?;
        let template = env.get_template("value_template")?;

        let value_json = match serde_json::from_str::<Value>(payload) {
            Ok(parsed) => minijinja::Value::from_serialize(&parsed),
            Err(_) => minijinja::Value::UNDEFINED,
        };
        let rendered = template.render(context! {
            value => payload,
            value_json => value_json,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let template = ValueTemplate::new("{{ value }}").unwrap();
        assert_eq!(template.render("21.5").unwrap(), "21.5");
    }

    #[test]
    fn test_json_field_extraction() {
        let template = ValueTemplate::new("{{ value_json.temperature }}").unwrap();
        assert_eq!(
            template.render(r#"{"temperature": 21.5, "humidity": 60}"#).unwrap(),
            "21.5"
        );
    }

    #[test]
    fn test_arithmetic() {
        let template = ValueTemplate::new("{{ value_json.raw / 10 }}").unwrap();
        assert_eq!(template.render(r#"{"raw": 215}"#).unwrap(), "21.5");
    }

    #[test]
    fn test_bad_syntax_rejected_at_construction() {
        assert!(ValueTemplate::new("{{ value").is_err());
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let template = ValueTemplate::new("{{ value_json.missing }}").unwrap();
        assert!(template.render(r#"{"other": 1}"#).is_err());
    }

    #[test]
    fn test_non_json_payload_with_value_json_is_an_error() {
        let template = ValueTemplate::new("{{ value_json.temperature }}").unwrap();
        assert!(template.render("not json").is_err());
    }
}
