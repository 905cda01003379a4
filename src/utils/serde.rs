/*!
 * Serde utilities for common serialization/deserialization patterns.
 *
 * Durations are written to JSON and TOML as plain integers (milliseconds or
 * seconds depending on the helper). The deserializers are lenient about how the
 * number arrives, since configuration values coming from environment variables
 * show up as strings.
 */

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a non-negative integer that may be represented as a number or a string.
///
/// ```toml
/// # All of these would be successfully parsed:
/// idle_poll_interval_ms = 100
/// idle_poll_interval_ms = "100"
/// idle_poll_interval_ms = 100.0
/// ```
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                Ok(i)
            } else if let Some(f) = n.as_f64().filter(|f| *f >= 0.0) {
                Ok(f as u64)
            } else {
                Err(D::Error::custom(format!("Invalid non-negative value: {n}")))
            }
        }
        serde_json::Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("Cannot parse '{s}' as an integer"))),
        other => Err(D::Error::custom(format!(
            "Expected numeric value, found: {other:?}"
        ))),
    }
}

/// `Duration` <-> integer milliseconds.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Policy {
///     #[serde(rename = "base_delay_ms", with = "review_orchestrator::utils::serde::duration_millis")]
///     base_delay: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_flexible_u64(deserializer).map(Duration::from_millis)
    }
}

/// `Duration` <-> integer seconds.
pub mod duration_secs {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_flexible_u64(deserializer).map(Duration::from_secs)
    }
}

/// `Option<Duration>` <-> optional integer seconds.
pub mod option_duration_secs {
    use super::*;
    use serde::Serialize;

    pub fn serialize<S>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => deserialize_flexible_u64(v)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(D::Error::custom),
        }
    }
}
