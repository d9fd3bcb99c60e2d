//! `victron-ble-mqtt` library.
//!
//! The binary (`src/main.rs`) is responsible for loading configuration,
//! logging setup and process exit codes. The supervisor in
//! [`crate::scheduler`] drives discovery and the publish cycle; it is tested
//! deterministically with an injected radio and an injected publisher.

pub mod broker;
pub mod config;
pub mod cycle;
pub mod discovery;
pub mod identity;
pub mod key;
pub mod scanner;
pub mod scheduler;
pub mod telemetry;
pub mod victron;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use broker::{BrokerSink, PublishBatch, PublishReport, Publisher};
pub use config::{ConfigError, Options, Settings, parse_duration};
pub use cycle::{CycleOutcome, run_cycle};
pub use discovery::{DiscoveryError, RawAdvertisement, Session, SessionState, discover};
pub use identity::{DeviceIdentity, canonicalize};
pub use key::{DeviceBinding, PresharedKey};
pub use scanner::{Backend, Observation, Radio, RealRadio, ScanError};
pub use scheduler::{Phase, RunError, Supervisor};
pub use telemetry::{FieldValue, TelemetryDecoder, TelemetryRecord};
pub use victron::{DecodeError, VictronCodec};
