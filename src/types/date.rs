// src/types/date.rs

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::cmp::Ordering;

use crate::error::ParseError;

/// A Parse timestamp, kept as the ISO-8601 text the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDate {
    pub iso: String,
}

impl ParseDate {
    pub fn new(iso_string: impl Into<String>) -> Self {
        ParseDate {
            iso: iso_string.into(),
        }
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        ParseDate {
            iso: datetime.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn iso(&self) -> &str {
        &self.iso
    }

    pub fn to_datetime(&self) -> Result<DateTime<Utc>, ParseError> {
        DateTime::parse_from_rfc3339(&self.iso)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ParseError::InvalidInput(format!("invalid date '{}': {}", self.iso, e)))
    }

    /// Accepts either a bare ISO string or the `{"__type":"Date","iso":..}` encoding.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ParseDate::new(s.clone())),
            Value::Object(map) if map.get("__type").and_then(Value::as_str) == Some("Date") => {
                map.get("iso").and_then(Value::as_str).map(ParseDate::new)
            }
            _ => None,
        }
    }

    /// The typed encoding used inside attribute values.
    pub fn to_json(&self) -> Value {
        json!({ "__type": "Date", "iso": self.iso })
    }

    /// Chronological comparison, falling back to text order when either side is unparseable.
    pub fn chronological_cmp(&self, other: &ParseDate) -> Ordering {
        match (self.to_datetime(), other.to_datetime()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => self.iso.cmp(&other.iso),
        }
    }
}

impl<'de> Deserialize<'de> for ParseDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        ParseDate::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("not a Parse date: {}", value)))
    }
}

impl Serialize for ParseDate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.iso)
    }
}
