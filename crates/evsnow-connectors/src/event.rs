//! Broker event data model.
//!
//! [`Event`] is an immutable record delivered by the broker. Property bags
//! are modeled as explicit [`PropertyMap`]s rather than dynamic attribute
//! bags; byte values are rendered to UTF-8 where valid and hex otherwise.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single value in an event's user or system property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// UTF-8 string.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// Raw bytes (AMQP binary values).
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Renders the value for semi-structured storage.
    ///
    /// Bytes become a UTF-8 string when they decode cleanly, otherwise a
    /// hex string, so the stored row never carries raw binary.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(_) => serde_json::Value::String(hex::encode(b)),
            },
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Ordered map of property names to values.
///
/// `BTreeMap` keeps rendering deterministic, which keeps re-ingested rows
/// byte-identical to their first ingestion.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Renders a property map as a JSON object for semi-structured storage.
#[must_use]
pub fn properties_to_json(props: &PropertyMap) -> serde_json::Value {
    serde_json::Value::Object(
        props
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// An immutable event as delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Opaque payload bytes.
    pub body: Vec<u8>,
    /// Partition the event was read from.
    pub partition_id: String,
    /// Broker-assigned sequence number, strictly increasing per partition.
    pub sequence_number: u64,
    /// Broker-assigned offset, opaque to the pipeline.
    pub offset: String,
    /// Wall clock at which the broker accepted the event.
    pub enqueued_time: DateTime<Utc>,
    /// Application-set properties.
    pub properties: PropertyMap,
    /// Broker-set properties.
    pub system_properties: PropertyMap,
}

impl Event {
    /// Parses the payload as JSON when possible, otherwise stores it as a
    /// string (UTF-8 or hex, same rule as property bytes).
    #[must_use]
    pub fn body_as_json(&self) -> serde_json::Value {
        if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&self.body) {
            return v;
        }
        match std::str::from_utf8(&self.body) {
            Ok(s) => serde_json::Value::String(s.to_string()),
            Err(_) => serde_json::Value::String(hex::encode(&self.body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_with_body(body: &[u8]) -> Event {
        Event {
            body: body.to_vec(),
            partition_id: "0".into(),
            sequence_number: 1,
            offset: "42".into(),
            enqueued_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            properties: PropertyMap::new(),
            system_properties: PropertyMap::new(),
        }
    }

    #[test]
    fn test_body_parses_json() {
        let ev = event_with_body(br#"{"device":"a1","temp":21.5}"#);
        let v = ev.body_as_json();
        assert_eq!(v["device"], "a1");
    }

    #[test]
    fn test_body_falls_back_to_string() {
        let ev = event_with_body(b"plain text payload");
        assert_eq!(
            ev.body_as_json(),
            serde_json::Value::String("plain text payload".into())
        );
    }

    #[test]
    fn test_body_invalid_utf8_is_hex() {
        let ev = event_with_body(&[0xff, 0xfe, 0x01]);
        assert_eq!(ev.body_as_json(), serde_json::Value::String("fffe01".into()));
    }

    #[test]
    fn test_property_bytes_utf8() {
        let v = PropertyValue::Bytes(b"hello".to_vec());
        assert_eq!(v.to_json(), serde_json::Value::String("hello".into()));
    }

    #[test]
    fn test_property_bytes_hex_fallback() {
        let v = PropertyValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(v.to_json(), serde_json::Value::String("deadbeef".into()));
    }

    #[test]
    fn test_properties_render_deterministically() {
        let mut props = PropertyMap::new();
        props.insert("z".into(), PropertyValue::Int(1));
        props.insert("a".into(), PropertyValue::from("x"));
        let rendered = properties_to_json(&props);
        let again = properties_to_json(&props);
        assert_eq!(rendered, again);
        assert_eq!(rendered["a"], "x");
        assert_eq!(rendered["z"], 1);
    }

    #[test]
    fn test_float_property() {
        let v = PropertyValue::Float(1.25);
        assert_eq!(v.to_json(), serde_json::json!(1.25));
    }
}
