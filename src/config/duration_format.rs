//! Duration parsing for configuration files.
//!
//! Supports two formats:
//! - `humantime`: `10s`, `1h 30m`, `2d`
//! - ISO 8601: `PT10S`, `PT1H30M`, `P2D`

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Parse a duration string.
///
/// Tries humantime first, then ISO 8601.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    if let Ok(d) = iso8601_duration::Duration::parse(s) {
        if let Some(std_duration) = d.to_std() {
            return Ok(std_duration);
        }
    }

    Err(format!(
        "invalid duration '{}': expected humantime (10s) or ISO 8601 (PT10S)",
        s
    ))
}

/// Deserialize a duration from a string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Serialize a duration to a humantime string.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = humantime::format_duration(*duration).to_string();
    s.serialize(serializer)
}
