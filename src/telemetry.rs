//! Telemetry decoding and the record → flat map projection.
//!
//! The cryptographic and wire-format work is delegated to a [`Codec`]. What
//! this module owns is turning the codec's structured record into a
//! [`TelemetryRecord`]: one entry per declared field, enumerations by name,
//! unreadable fields skipped.

use crate::discovery::RawAdvertisement;
use crate::key::PresharedKey;
use crate::victron::DecodeError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// A scalar telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    /// Free text or the symbolic name of an enumeration.
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(n) => write!(f, "{n}"),
            FieldValue::Float(n) => write!(f, "{n}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Float(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

/// Why a single field could not be read.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("payload truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown code {0:#04x}")]
    UnknownCode(u8),
}

/// One declared field of a record, as read from the payload.
///
/// `Ok(None)` means the device reported the field as not available.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReading {
    pub name: &'static str,
    pub value: Result<Option<FieldValue>, FieldError>,
}

impl FieldReading {
    pub fn new(name: &'static str, value: Result<Option<FieldValue>, FieldError>) -> Self {
        Self { name, value }
    }
}

/// A record shape with a statically declared field list.
pub trait Project {
    fn fields(&self) -> Vec<FieldReading>;
}

/// Decrypts and parses a raw advertisement payload.
pub trait Codec: Send + Sync {
    type Record: Project;

    fn parse(&self, payload: &[u8], key: &PresharedKey) -> Result<Self::Record, DecodeError>;
}

/// Decoded telemetry: field name to optional scalar.
///
/// Each recognized field appears exactly once. `None` marks a field the device
/// reported as unavailable; it is dropped before anything is published.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryRecord {
    fields: BTreeMap<String, Option<FieldValue>>,
}

impl TelemetryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Option<FieldValue>) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Option<FieldValue>> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&FieldValue>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}

impl<K: Into<String>> FromIterator<(K, Option<FieldValue>)> for TelemetryRecord {
    fn from_iter<I: IntoIterator<Item = (K, Option<FieldValue>)>>(iter: I) -> Self {
        let mut record = TelemetryRecord::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

/// Flatten a structured record, skipping fields that fail to read.
pub fn project<R: Project>(record: &R) -> TelemetryRecord {
    let mut flat = TelemetryRecord::new();
    for reading in record.fields() {
        match reading.value {
            Ok(value) => {
                debug!(field = reading.name, value = ?value, "decoded field");
                flat.insert(reading.name, value);
            }
            Err(error) => {
                debug!(field = reading.name, %error, "skipping unreadable field");
            }
        }
    }
    flat
}

/// Decodes advertisements for the locked device.
#[derive(Debug, Clone, Default)]
pub struct TelemetryDecoder<C> {
    codec: C,
}

impl<C: Codec> TelemetryDecoder<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    /// Decrypt, parse and flatten one advertisement.
    ///
    /// # Errors
    /// Returns the codec's `DecodeError` when the payload as a whole cannot be
    /// parsed. Individual unreadable fields never fail the decode.
    pub fn decode(
        &self,
        raw: &RawAdvertisement,
        key: &PresharedKey,
    ) -> Result<TelemetryRecord, DecodeError> {
        let record = self.codec.parse(&raw.payload, key)?;
        Ok(project(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_KEY, solar_charger_advertisement, test_identity};

    struct Fixed(Vec<FieldReading>);

    impl Project for Fixed {
        fn fields(&self) -> Vec<FieldReading> {
            self.0.clone()
        }
    }

    #[test]
    fn test_project_keeps_nulls_and_skips_errors() {
        let record = Fixed(vec![
            FieldReading::new("voltage", Ok(Some(12.8.into()))),
            FieldReading::new("state", Ok(Some("FLOAT".into()))),
            FieldReading::new("error", Ok(None)),
            FieldReading::new(
                "load",
                Err(FieldError::Truncated {
                    needed: 12,
                    available: 10,
                }),
            ),
        ]);

        let flat = project(&record);
        assert_eq!(flat.len(), 3);
        assert_eq!(flat.get("voltage"), Some(&Some(FieldValue::Float(12.8))));
        assert_eq!(flat.get("state"), Some(&Some(FieldValue::from("FLOAT"))));
        assert_eq!(flat.get("error"), Some(&None));
        assert_eq!(flat.get("load"), None);
    }

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Float(13.1).to_string(), "13.1");
        assert_eq!(FieldValue::Integer(240).to_string(), "240");
        assert_eq!(FieldValue::from("BULK").to_string(), "BULK");
    }

    #[test]
    fn test_decoder_with_victron_codec() {
        let decoder = TelemetryDecoder::new(crate::victron::VictronCodec);
        let raw = RawAdvertisement {
            sender: test_identity(),
            payload: solar_charger_advertisement(&TEST_KEY, 0x0042),
        };

        let record = decoder.decode(&raw, &TEST_KEY).unwrap();
        assert_eq!(
            record.get("charge_state"),
            Some(&Some(FieldValue::from("FLOAT")))
        );
        assert_eq!(
            record.get("battery_voltage"),
            Some(&Some(FieldValue::Float(13.1)))
        );
        assert_eq!(
            record.get("external_device_load"),
            Some(&None),
            "load sentinel maps to null"
        );
    }

    #[test]
    fn test_decoder_propagates_codec_failure() {
        let decoder = TelemetryDecoder::new(crate::victron::VictronCodec);
        let raw = RawAdvertisement {
            sender: test_identity(),
            payload: vec![0x10, 0x00],
        };
        assert!(matches!(
            decoder.decode(&raw, &TEST_KEY),
            Err(DecodeError::TooShort(2))
        ));
    }
}
