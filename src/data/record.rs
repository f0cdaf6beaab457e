//! The persisted unit: a payload and the time it was first seen.
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Timestamp layout used in the log file.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An immutable `(timestamp, payload)` pair.
///
/// Serialized as a two-field row, timestamp first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(with = "log_timestamp")]
    timestamp: NaiveDateTime,
    payload: String,
}

impl Record {
    /// Create a record. Sub-second precision is dropped so the value is exactly
    /// what a later scan of the log reads back.
    pub fn new(timestamp: NaiveDateTime, payload: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
            payload: payload.into(),
        }
    }

    /// When the payload was first accepted.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// The scanned message.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}  {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.payload
        )
    }
}

mod log_timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}
