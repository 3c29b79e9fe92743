//! Topic names, subscription filters and matching.
//!
//! Filters use MQTT syntax: `+` matches exactly one level, `#` matches any
//! number of trailing levels (including none) and must be the last level.

use crate::error::{BusError, Result};

/// Default topic for raw device lines.
pub const DEFAULT_RAW_TOPIC: &str = "meshspy/raw";

/// Default topic for structured node telemetry.
pub const DEFAULT_TELEMETRY_TOPIC: &str = "meshspy/nodes";

const MAX_TOPIC_LEN: usize = 65_535;

/// Check that a topic can be published to.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BusError::config("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(BusError::config(format!(
            "topic exceeds {} bytes",
            MAX_TOPIC_LEN
        )));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(BusError::config(format!(
            "topic '{}' contains wildcard or NUL characters",
            topic
        )));
    }
    Ok(())
}

/// Check that a subscription filter is well formed.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(BusError::config("topic filter must not be empty"));
    }
    if filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(BusError::config(format!("invalid topic filter '{}'", filter)));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(BusError::config(format!(
                "'#' must be the last level on its own in '{}'",
                filter
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(BusError::config(format!(
                "'+' must occupy a whole level in '{}'",
                filter
            )));
        }
    }
    Ok(())
}

/// Whether `topic` is matched by subscription `filter`.
///
/// # Example
/// ```
/// use meshspy_bus::topic::topic_matches;
///
/// assert!(topic_matches("meshspy/nodes/+", "meshspy/nodes/n1"));
/// assert!(topic_matches("meshspy/#", "meshspy/nodes/n1"));
/// assert!(!topic_matches("meshspy/raw", "meshspy/nodes"));
/// ```
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match system topics at the first level
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Translate an MQTT filter into a Zenoh key expression.
///
/// # Example
/// ```
/// use meshspy_bus::topic::to_key_expr;
///
/// assert_eq!(to_key_expr("meshspy/+/temp"), "meshspy/*/temp");
/// assert_eq!(to_key_expr("meshspy/#"), "meshspy/**");
/// ```
pub fn to_key_expr(filter: &str) -> String {
    filter
        .split('/')
        .map(|level| match level {
            "+" => "*",
            "#" => "**",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}
