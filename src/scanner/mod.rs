//! BLE advertisement scanning.
//!
//! This module provides a trait-based abstraction over different Bluetooth
//! scanning backends. Backends forward the Victron manufacturer data of every
//! advertisement they see as an [`Observation`] over a channel; they do not
//! decode or filter by device. Dropping the receiver stops the scan.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// A single advertisement as seen by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Sender address as reported by the backend, not yet canonical.
    pub sender: String,
    /// Manufacturer data without the company identifier.
    pub payload: Vec<u8>,
}

impl Observation {
    pub fn new(sender: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            sender: sender.into(),
            payload,
        }
    }
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Channel buffer size for observations.
pub const OBSERVATION_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Future returned by [`Radio::start_scan`].
pub type ScanFuture<'a> =
    Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Observation>, ScanError>> + Send + 'a>>;

/// Radio abstraction to enable deterministic tests without Bluetooth hardware.
pub trait Radio: Send + Sync {
    /// Start scanning; observations arrive on the returned receiver until it
    /// is dropped.
    fn start_scan(&self) -> ScanFuture<'_>;
}

/// Real radio that delegates to a compiled-in backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealRadio {
    backend: Backend,
}

impl RealRadio {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl Radio for RealRadio {
    fn start_scan(&self) -> ScanFuture<'_> {
        Box::pin(start_scan(self.backend))
    }
}

/// Start scanning for Victron advertisements using the specified backend.
pub async fn start_scan(backend: Backend) -> Result<mpsc::Receiver<Observation>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
    }
}
