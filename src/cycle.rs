//! One publish cycle: decode the latest advertisement and deliver it.

use crate::broker::{BrokerSink, PublishBatch, PublishReport, Publisher};
use crate::discovery::Session;
use crate::key::PresharedKey;
use crate::telemetry::{Codec, TelemetryDecoder};
use chrono::Utc;
use tracing::{info, warn};

/// What a cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A batch was handed to the sink; the report says how delivery went.
    Published(PublishReport),
    /// No locked device or payload; the broker was not contacted.
    NoData,
    /// The payload could not be decoded; nothing was published.
    DecodeFailed,
    /// Shutdown began before the cycle ran; nothing was published.
    Cancelled,
}

/// Decode the session's latest payload and publish it.
pub async fn run_cycle<C: Codec, P: Publisher>(
    session: &Session,
    key: &PresharedKey,
    decoder: &TelemetryDecoder<C>,
    sink: &BrokerSink<P>,
) -> CycleOutcome {
    let Some(raw) = session.latest() else {
        warn!("no data received from device");
        return CycleOutcome::NoData;
    };

    let record = match decoder.decode(raw, key) {
        Ok(record) => record,
        Err(error) => {
            warn!(identity = %raw.sender, %error, "failed to decode advertisement");
            return CycleOutcome::DecodeFailed;
        }
    };
    info!(identity = %raw.sender, fields = record.len(), "read device data");

    let batch = PublishBatch::new(&record, Utc::now());
    CycleOutcome::Published(sink.publish(&batch).await)
}
