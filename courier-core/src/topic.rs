//! MQTT topic utilities.
//!
//! Splits topic names into levels and checks topic names and topic filters
//! against the MQTT rules before they reach the broker.

use crate::error::TopicError;

/// Maximum topic name/filter length in bytes (UTF-8 encoded).
pub const MAX_TOPIC_LENGTH: usize = 65535;

/// Split a topic name or filter into its levels.
///
/// Splitting is done byte-wise on `/` and preserves empty levels, so `"/"`
/// splits into two empty levels. This is safe for UTF-8 input: no multi-byte
/// sequence contains the `/` byte. Joining the levels back with `/` yields
/// the original string.
///
/// # Examples
///
/// ```
/// use courier_core::topic::split_topic;
///
/// assert_eq!(split_topic("a/b/c").unwrap(), vec!["a", "b", "c"]);
/// assert_eq!(split_topic("/").unwrap(), vec!["", ""]);
/// assert!(split_topic("").is_err());
/// ```
pub fn split_topic(topic: &str) -> Result<Vec<&str>, TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    Ok(topic.split('/').collect())
}

/// Check a topic name for publishing: well formed and wildcard-free.
///
/// # Examples
///
/// ```
/// use courier_core::topic::validate_publish_topic;
///
/// assert!(validate_publish_topic("devices/gear-7/state").is_ok());
/// assert!(validate_publish_topic("devices/+/state").is_err());
/// ```
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    well_formed_levels(topic)?;

    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInPublishTopic);
    }

    Ok(())
}

/// Check a topic filter for subscribing: well formed, with `+` only as a
/// whole level and `#` only as the whole final level.
///
/// # Examples
///
/// ```
/// use courier_core::topic::validate_subscribe_filter;
///
/// assert!(validate_subscribe_filter("devices/+/state").is_ok());
/// assert!(validate_subscribe_filter("devices/#").is_ok());
/// assert!(validate_subscribe_filter("devices/gear+/state").is_err());
/// assert!(validate_subscribe_filter("devices/#/state").is_err());
/// ```
pub fn validate_subscribe_filter(filter: &str) -> Result<(), TopicError> {
    let levels = well_formed_levels(filter)?;
    let last = levels.len() - 1;

    for (position, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            // `#` closes the filter; nothing may follow it.
            "#" if position == last => {}
            "#" => return Err(TopicError::InvalidMultiLevelWildcard),
            mixed if mixed.contains('+') => {
                return Err(TopicError::InvalidSingleLevelWildcard);
            }
            mixed if mixed.contains('#') => {
                return Err(TopicError::InvalidMultiLevelWildcard);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Well-formedness rules shared by topic names and filters: within the MQTT
/// length limit, free of NUL bytes, and splittable (non-empty). Hands back
/// the levels so callers can reuse the split.
fn well_formed_levels(topic: &str) -> Result<Vec<&str>, TopicError> {
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }

    if topic.bytes().any(|byte| byte == 0) {
        return Err(TopicError::ContainsNullChar);
    }

    split_topic(topic)
}
