//! Per-entity attribute overrides
//!
//! The customize table is built once from configuration and injected into
//! the `OpenPeerPower` handle. It is read-only after construction, so the
//! state write path can consult it without synchronization.

use std::collections::HashMap;

use serde_json::Value;

/// Read-only table of per-entity_id attribute overrides
#[derive(Debug, Clone, Default)]
pub struct Customize {
    overrides: HashMap<String, HashMap<String, Value>>,
}

impl Customize {
    /// An empty table: no overrides apply
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a table
    pub fn builder() -> CustomizeBuilder {
        CustomizeBuilder::default()
    }

    /// Get the overrides for an entity, if any
    pub fn get(&self, entity_id: &str) -> Option<&HashMap<String, Value>> {
        self.overrides.get(entity_id)
    }

    /// Apply the overrides for an entity onto an attribute map
    pub fn apply(&self, entity_id: &str, attributes: &mut HashMap<String, Value>) {
        if let Some(overrides) = self.overrides.get(entity_id) {
            for (key, value) in overrides {
                attributes.insert(key.clone(), value.clone());
            }
        }
    }

    /// Whether the table has no overrides at all
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// Builder for [`Customize`]
#[derive(Debug, Default)]
pub struct CustomizeBuilder {
    overrides: HashMap<String, HashMap<String, Value>>,
}

impl CustomizeBuilder {
    /// Set one attribute override for an entity
    pub fn set(
        mut self,
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        value: Value,
    ) -> Self {
        self.overrides
            .entry(entity_id.into())
            .or_default()
            .insert(attribute.into(), value);
        self
    }

    /// Set all overrides for an entity at once
    pub fn set_all(
        mut self,
        entity_id: impl Into<String>,
        attributes: HashMap<String, Value>,
    ) -> Self {
        self.overrides
            .entry(entity_id.into())
            .or_default()
            .extend(attributes);
        self
    }

    pub fn build(self) -> Customize {
        Customize {
            overrides: self.overrides,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_overrides() {
        let customize = Customize::builder()
            .set("light.kitchen", "friendly_name", json!("Kitchen Light"))
            .set("light.kitchen", "icon", json!("mdi:bulb"))
            .build();

        let mut attrs = HashMap::from([("friendly_name".to_string(), json!("kitchen"))]);
        customize.apply("light.kitchen", &mut attrs);

        assert_eq!(attrs["friendly_name"], json!("Kitchen Light"));
        assert_eq!(attrs["icon"], json!("mdi:bulb"));
    }

    #[test]
    fn test_no_overrides_for_other_entities() {
        let customize = Customize::builder()
            .set("light.kitchen", "icon", json!("mdi:bulb"))
            .build();

        let mut attrs = HashMap::new();
        customize.apply("light.bedroom", &mut attrs);
        assert!(attrs.is_empty());
    }
}
