//! Typed values and their BSON payload encoding
//!
//! Every Astarte MQTT v1 data payload is a BSON document with the value under
//! `v`, an optional explicit timestamp under `t` and optional string metadata
//! under `m`. An empty payload is an unset and never goes through this module.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// A single mapping value.
#[derive(Debug, Clone, PartialEq)]
pub enum AstarteValue {
    Bool(bool),
    Int(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] bson::ser::Error),
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] bson::de::Error),
    #[error("Payload has no value field")]
    MissingValue,
    #[error("Unsupported value type in payload: {0:?}")]
    UnsupportedType(bson::spec::ElementType),
}

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub value: AstarteValue,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl AstarteValue {
    fn to_bson(&self) -> Bson {
        match self {
            AstarteValue::Bool(v) => Bson::Boolean(*v),
            AstarteValue::Int(v) => Bson::Int32(*v),
            AstarteValue::Int64(v) => Bson::Int64(*v),
            AstarteValue::Double(v) => Bson::Double(*v),
            AstarteValue::String(v) => Bson::String(v.clone()),
            AstarteValue::Bytes(v) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: v.clone(),
            }),
            AstarteValue::Timestamp(v) => Bson::DateTime(to_bson_datetime(*v)),
        }
    }

    fn from_bson(value: &Bson) -> Result<Self, PayloadError> {
        Ok(match value {
            Bson::Boolean(v) => AstarteValue::Bool(*v),
            Bson::Int32(v) => AstarteValue::Int(*v),
            Bson::Int64(v) => AstarteValue::Int64(*v),
            Bson::Double(v) => AstarteValue::Double(*v),
            Bson::String(v) => AstarteValue::String(v.clone()),
            Bson::Binary(binary) => AstarteValue::Bytes(binary.bytes.clone()),
            Bson::DateTime(v) => AstarteValue::Timestamp(from_bson_datetime(*v)),
            other => return Err(PayloadError::UnsupportedType(other.element_type())),
        })
    }

    /// Encode as a data payload.
    pub fn to_payload(
        &self,
        timestamp: Option<DateTime<Utc>>,
        metadata: &HashMap<String, String>,
    ) -> Result<Vec<u8>, PayloadError> {
        let mut document = Document::new();
        document.insert("v", self.to_bson());
        if let Some(timestamp) = timestamp {
            document.insert("t", Bson::DateTime(to_bson_datetime(timestamp)));
        }
        if !metadata.is_empty() {
            let mut meta = Document::new();
            for (key, value) in metadata {
                meta.insert(key.clone(), Bson::String(value.clone()));
            }
            document.insert("m", meta);
        }

        let mut buffer = Vec::new();
        document.to_writer(&mut buffer)?;
        Ok(buffer)
    }

    /// Decode a data payload produced by [`AstarteValue::to_payload`] or by the broker.
    pub fn from_payload(payload: &[u8]) -> Result<DecodedPayload, PayloadError> {
        let document = Document::from_reader(payload)?;
        let value = document.get("v").ok_or(PayloadError::MissingValue)?;
        let value = Self::from_bson(value)?;

        let timestamp = match document.get("t") {
            Some(Bson::DateTime(t)) => Some(from_bson_datetime(*t)),
            _ => None,
        };

        let metadata = match document.get("m") {
            Some(Bson::Document(meta)) => meta
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect(),
            _ => HashMap::new(),
        };

        Ok(DecodedPayload {
            value,
            timestamp,
            metadata,
        })
    }
}

fn to_bson_datetime(value: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(value.timestamp_millis())
}

fn from_bson_datetime(value: bson::DateTime) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value.timestamp_millis())
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl From<bool> for AstarteValue {
    fn from(v: bool) -> Self {
        AstarteValue::Bool(v)
    }
}

impl From<i32> for AstarteValue {
    fn from(v: i32) -> Self {
        AstarteValue::Int(v)
    }
}

impl From<i64> for AstarteValue {
    fn from(v: i64) -> Self {
        AstarteValue::Int64(v)
    }
}

impl From<f64> for AstarteValue {
    fn from(v: f64) -> Self {
        AstarteValue::Double(v)
    }
}

impl From<&str> for AstarteValue {
    fn from(v: &str) -> Self {
        AstarteValue::String(v.to_string())
    }
}

impl From<String> for AstarteValue {
    fn from(v: String) -> Self {
        AstarteValue::String(v)
    }
}

impl From<Vec<u8>> for AstarteValue {
    fn from(v: Vec<u8>) -> Self {
        AstarteValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for AstarteValue {
    fn from(v: DateTime<Utc>) -> Self {
        AstarteValue::Timestamp(v)
    }
}
