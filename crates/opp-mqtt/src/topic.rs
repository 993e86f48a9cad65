//! MQTT topic validation and wildcard matching

use crate::error::ConfigError;

/// Longest topic the broker accepts, in bytes
const MAX_TOPIC_LENGTH: usize = 65_535;

fn invalid(topic: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.into(),
    }
}

/// Validate the rules shared by publish and subscribe topics
pub fn valid_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(invalid(topic, "must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(invalid(topic, "longer than 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(invalid(topic, "must not contain null characters"));
    }
    Ok(())
}

/// Validate a subscription filter.
///
/// `+` must occupy a whole level; `#` must occupy the final level.
pub fn valid_subscribe_topic(topic: &str) -> Result<(), ConfigError> {
    valid_topic(topic)?;

    let levels: Vec<&str> = topic.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(invalid(topic, "single-level wildcard must span a whole level"));
        }
        if level.contains('#') {
            if *level != "#" {
                return Err(invalid(topic, "multi-level wildcard must span a whole level"));
            }
            if index != levels.len() - 1 {
                return Err(invalid(topic, "multi-level wildcard must be the last level"));
            }
        }
    }
    Ok(())
}

/// Validate a publish topic: no wildcards allowed
pub fn valid_publish_topic(topic: &str) -> Result<(), ConfigError> {
    valid_topic(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(invalid(topic, "wildcards are not allowed in publish topics"));
    }
    Ok(())
}

/// Whether a concrete topic matches a subscription filter
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
