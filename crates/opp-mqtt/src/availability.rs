//! Birth/will availability tracking
//!
//! An entity is online or offline according to one or more availability
//! topics. The singular `availability_topic` form and the `availability`
//! list form are mutually exclusive; the combining mode decides how
//! multiple topics vote.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

/// How multiple availability topics combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityMode {
    /// The most recently received topic wins
    Latest,
    /// Every topic must report online
    All,
    /// One online topic suffices
    #[default]
    Any,
}

pub(crate) fn default_payload_available() -> String {
    "online".to_string()
}

pub(crate) fn default_payload_not_available() -> String {
    "offline".to_string()
}

/// One availability topic with its expected payloads
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityEntry {
    pub topic: String,
    #[serde(default = "default_payload_available")]
    pub payload_available: String,
    #[serde(default = "default_payload_not_available")]
    pub payload_not_available: String,
}

/// Resolved availability configuration for one entity
#[derive(Debug, Clone)]
pub struct AvailabilityConfig {
    pub entries: Vec<AvailabilityEntry>,
    pub mode: AvailabilityMode,
}

/// Tracks the reported status per topic and combines per the mode.
///
/// Until a topic reports, it does not vote: an entity with availability
/// configured starts offline.
pub struct AvailabilityTracker {
    config: AvailabilityConfig,
    status: Mutex<HashMap<String, bool>>,
    last_topic: Mutex<Option<String>>,
}

impl AvailabilityTracker {
    pub fn new(config: AvailabilityConfig) -> Self {
        Self {
            config,
            status: Mutex::new(HashMap::new()),
            last_topic: Mutex::new(None),
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &AvailabilityEntry> {
        self.config.entries.iter()
    }

    /// Feed one availability message. Returns true when the message was
    /// recognized for one of the configured topics.
    pub fn on_message(&self, topic: &str, payload: &str) -> bool {
        let Some(entry) = self.config.entries.iter().find(|e| e.topic == topic) else {
            return false;
        };

        let online = if payload == entry.payload_available {
            true
        } else if payload == entry.payload_not_available {
            false
        } else {
            return false;
        };

        if let Ok(mut status) = self.status.lock() {
            status.insert(topic.to_string(), online);
        }
        if let Ok(mut last) = self.last_topic.lock() {
            *last = Some(topic.to_string());
        }
        true
    }

    /// The reported status per topic, for carrying across config rebuilds
    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Seed the status of configured topics from an earlier snapshot
    pub fn seed(&self, previous: &HashMap<String, bool>) {
        if let Ok(mut status) = self.status.lock() {
            for entry in &self.config.entries {
                if let Some(online) = previous.get(&entry.topic) {
                    status.insert(entry.topic.clone(), *online);
                }
            }
        }
    }

    /// The combined verdict
    pub fn available(&self) -> bool {
        let status = match self.status.lock() {
            Ok(status) => status,
            Err(_) => return false,
        };

        match self.config.mode {
            AvailabilityMode::Latest => self
                .last_topic
                .lock()
                .ok()
                .and_then(|last| last.as_ref().and_then(|t| status.get(t).copied()))
                .unwrap_or(false),
            AvailabilityMode::All => {
                !self.config.entries.is_empty()
                    && self
                        .config
                        .entries
                        .iter()
                        .all(|e| status.get(&e.topic).copied().unwrap_or(false))
            }
            AvailabilityMode::Any => self
                .config
                .entries
                .iter()
                .any(|e| status.get(&e.topic).copied().unwrap_or(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: AvailabilityMode, topics: &[&str]) -> AvailabilityConfig {
        AvailabilityConfig {
            entries: topics
                .iter()
                .map(|t| AvailabilityEntry {
                    topic: t.to_string(),
                    payload_available: default_payload_available(),
                    payload_not_available: default_payload_not_available(),
                })
                .collect(),
            mode,
        }
    }

    #[test]
    fn test_starts_offline() {
        let tracker = AvailabilityTracker::new(config(AvailabilityMode::Any, &["tele/avty"]));
        assert!(!tracker.available());
    }

    #[test]
    fn test_any_mode() {
        let tracker = AvailabilityTracker::new(config(AvailabilityMode::Any, &["a", "b"]));
        tracker.on_message("a", "offline");
        assert!(!tracker.available());
        tracker.on_message("b", "online");
        assert!(tracker.available());
    }

    #[test]
    fn test_all_mode() {
        let tracker = AvailabilityTracker::new(config(AvailabilityMode::All, &["a", "b"]));
        tracker.on_message("a", "online");
        assert!(!tracker.available());
        tracker.on_message("b", "online");
        assert!(tracker.available());
        tracker.on_message("a", "offline");
        assert!(!tracker.available());
    }

    #[test]
    fn test_latest_mode() {
        let tracker = AvailabilityTracker::new(config(AvailabilityMode::Latest, &["a", "b"]));
        tracker.on_message("a", "online");
        tracker.on_message("b", "offline");
        assert!(!tracker.available());
        tracker.on_message("a", "online");
        assert!(tracker.available());
    }

    #[test]
    fn test_unrecognized_payload_ignored() {
        let tracker = AvailabilityTracker::new(config(AvailabilityMode::Any, &["a"]));
        tracker.on_message("a", "online");
        assert!(!tracker.on_message("a", "garbled"));
        assert!(tracker.available());
    }

    #[test]
    fn test_snapshot_survives_rebuild() {
        let first = AvailabilityTracker::new(config(AvailabilityMode::Any, &["a"]));
        first.on_message("a", "online");

        let second = AvailabilityTracker::new(config(AvailabilityMode::Any, &["a", "b"]));
        second.seed(&first.snapshot());
        assert!(second.available());
    }

    #[test]
    fn test_custom_payloads() {
        let tracker = AvailabilityTracker::new(AvailabilityConfig {
            entries: vec![AvailabilityEntry {
                topic: "tele/LWT".to_string(),
                payload_available: "Online".to_string(),
                payload_not_available: "Offline".to_string(),
            }],
            mode: AvailabilityMode::Any,
        });
        tracker.on_message("tele/LWT", "Online");
        assert!(tracker.available());
    }
}
