//! Topic name, topic filter and client identifier rules.

use crate::encoding::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};

/// Validates a topic a message is published to.
///
/// # Errors
/// Returns `InvalidTopicName` if the name is empty, too long or contains a
/// wildcard character.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(MqttError::InvalidTopicName(
            "Topic name cannot be empty".to_string(),
        ));
    }
    if topic.len() > MAX_STRING_LENGTH {
        return Err(MqttError::InvalidTopicName(format!(
            "Topic name exceeds {MAX_STRING_LENGTH} bytes"
        )));
    }
    if topic.contains(['+', '#']) {
        return Err(MqttError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validates a subscription filter.
///
/// # Errors
/// Returns `InvalidTopicFilter` if a wildcard is not alone in its level or
/// `#` is not the last level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(MqttError::InvalidTopicFilter(
            "Topic filter cannot be empty".to_string(),
        ));
    }
    if filter.len() > MAX_STRING_LENGTH {
        return Err(MqttError::InvalidTopicFilter(format!(
            "Topic filter exceeds {MAX_STRING_LENGTH} bytes"
        )));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err(MqttError::InvalidTopicFilter(format!(
                    "'#' must be the last level in '{filter}'"
                )));
            }
            "#" | "+" => {}
            other if other.contains(['+', '#']) => {
                return Err(MqttError::InvalidTopicFilter(format!(
                    "Wildcard must occupy a whole level in '{filter}'"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Level-by-level match of a topic against a filter.
///
/// Topics starting with `$` are never matched by a filter whose first
/// level is a wildcard.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

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

/// Accepts any non-empty UTF-8 identifier up to 65535 bytes.
///
/// 3.1.1 servers may accept identifiers beyond the 23 character
/// alphanumeric minimum; only emptiness is handled by the caller.
#[must_use]
pub fn is_valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty() && client_id.len() <= MAX_STRING_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("/leading").is_ok());
        assert!(validate_topic_name("a//b").is_ok());
        assert!(validate_topic_name("$SYS/uptime").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/b").is_err());
        assert!(validate_topic_name("a/#").is_err());
    }

    #[test]
    fn test_topic_filters() {
        for valid in ["#", "+", "a/+/c", "a/#", "+/+", "/+", "a//b", "$SYS/#"] {
            assert!(validate_topic_filter(valid).is_ok(), "{valid}");
        }
        for invalid in ["", "a/#/c", "a#", "a/b+", "+a/b", "##"] {
            assert!(validate_topic_filter(invalid).is_err(), "{invalid}");
        }
    }

    #[test]
    fn test_matching() {
        assert!(topic_matches_filter("a/b/c", "a/b/c"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "#"));
        assert!(topic_matches_filter("/x", "+/x"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/+"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
        assert!(!topic_matches_filter("b/a", "a/#"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_root_wildcards() {
        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/uptime", "+/uptime"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/#"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/+"));
    }

    #[test]
    fn test_client_ids() {
        assert!(is_valid_client_id("sensor-17"));
        assert!(is_valid_client_id("a-very-long-client-identifier-over-23"));
        assert!(!is_valid_client_id(""));
    }
}
