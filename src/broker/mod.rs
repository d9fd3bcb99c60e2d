//! Broker sink: per-field retained messages plus one combined snapshot.
//!
//! Every field of a [`PublishBatch`] goes to `{base}/{field}` as plain text,
//! then the whole batch goes to `{base}/all` as a JSON object. Each publish is
//! attempted on its own with a bounded timeout; failures are collected in a
//! [`PublishReport`] instead of being raised.

pub mod mqtt;

use crate::telemetry::{FieldValue, TelemetryRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Base path of every topic.
pub const BASE_TOPIC: &str = "victron/mppt150_45";

/// Last path segment of the combined snapshot topic.
pub const COMBINED_SEGMENT: &str = "all";

/// Name under which the capture time is published.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Default upper bound on a single publish call.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic for a single field.
pub fn field_topic(field: &str) -> String {
    format!("{BASE_TOPIC}/{field}")
}

/// Topic for the combined snapshot.
pub fn combined_topic() -> String {
    field_topic(COMBINED_SEGMENT)
}

/// A single publish that did not go through.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("client error: {0}")]
    Client(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("encoding error: {0}")]
    Encode(String),
}

/// Future returned by [`Publisher::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

/// Future returned by [`Publisher::disconnect`].
pub type DisconnectFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Broker transport abstraction; the MQTT client in production, a recorder in tests.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> PublishFuture<'_>;

    /// Release the connection. Publishing afterwards fails.
    fn disconnect(&self) -> DisconnectFuture<'_>;
}

/// A decoded record with its capture time, ready for delivery.
///
/// Null fields are dropped on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishBatch {
    pub timestamp: DateTime<Utc>,
    fields: Vec<(String, FieldValue)>,
}

impl PublishBatch {
    pub fn new(record: &TelemetryRecord, timestamp: DateTime<Utc>) -> Self {
        let fields = record
            .iter()
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v.clone())))
            .collect();
        Self { timestamp, fields }
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Capture time as ISO-8601.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// The combined snapshot: `timestamp` followed by every field.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for PublishBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry(TIMESTAMP_FIELD, &self.timestamp_string())?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Literal text for a single-field message.
///
/// Floats keep their decimal point (`12.0`, not `12`).
pub fn field_payload(value: &FieldValue) -> String {
    match value {
        FieldValue::Integer(n) => n.to_string(),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(|n| n.to_string())
            .unwrap_or_else(|| f.to_string()),
        FieldValue::Text(s) => s.clone(),
    }
}

/// A topic whose publish failed.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishFailure {
    pub topic: String,
    pub error: PublishError,
}

/// Outcome of delivering one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PublishReport {
    pub attempted: usize,
    pub failures: Vec<PublishFailure>,
}

impl PublishReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, topic: String, result: Result<(), PublishError>) {
        self.attempted += 1;
        match result {
            Ok(()) => debug!(%topic, "published"),
            Err(error) => {
                warn!(%topic, %error, "failed to publish");
                self.failures.push(PublishFailure { topic, error });
            }
        }
    }
}

/// Delivers batches through a [`Publisher`].
pub struct BrokerSink<P> {
    publisher: P,
    timeout: Duration,
}

impl<P: Publisher> BrokerSink<P> {
    pub fn new(publisher: P, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub async fn close(&self) {
        self.publisher.disconnect().await;
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let publish = self.publisher.publish(topic.to_string(), payload, true);
        tokio::time::timeout(self.timeout, publish)
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?
    }

    /// Publish every field, the capture time and the combined snapshot.
    ///
    /// Never fails; per-topic failures are in the returned report.
    pub async fn publish(&self, batch: &PublishBatch) -> PublishReport {
        let mut report = PublishReport::default();

        for (name, value) in batch.fields() {
            let topic = field_topic(name);
            let result = self.send(&topic, field_payload(value).into_bytes()).await;
            report.record(topic, result);
        }

        let topic = field_topic(TIMESTAMP_FIELD);
        let result = self.send(&topic, batch.timestamp_string().into_bytes()).await;
        report.record(topic, result);

        let topic = combined_topic();
        let result = match batch.snapshot_json() {
            Ok(json) => self.send(&topic, json.into_bytes()).await,
            Err(e) => Err(PublishError::Encode(e.to_string())),
        };
        report.record(topic, result);

        if report.is_complete() {
            info!(published = report.attempted, "published complete data");
        } else {
            warn!(
                published = report.succeeded(),
                failed = report.failures.len(),
                "published partial data"
            );
        }
        report
    }
}
