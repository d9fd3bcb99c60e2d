//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{OBSERVATION_CHANNEL_BUFFER_SIZE, Observation, ScanError};
use crate::identity::DeviceIdentity;
use crate::victron::{VICTRON_MANUFACTURER_ID, VICTRON_MANUFACTURER_ID_BYTES};
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Session};
use futures::{Stream, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
const MANUFACTURER_DATA_TYPE: u8 = 0xff;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start scanning for Victron devices using the BlueZ D-Bus backend.
///
/// Registers a passive advertisement monitor matching the Victron company
/// identifier. The background task ends when the receiver is dropped.
pub async fn start_scan() -> Result<mpsc::Receiver<Observation>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(OBSERVATION_CHANNEL_BUFFER_SIZE);

    let pattern = Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: VICTRON_MANUFACTURER_ID_BYTES.to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    // The task owns all Bluetooth state; dropping it unregisters the monitor.
    tokio::spawn(async move {
        let _session = session;
        let _monitor_manager = monitor_manager;
        let adapter = &adapter;

        forward(monitor_handle, tx, move |event| async move {
            let MonitorEvent::DeviceFound(device_id) = event else {
                return None;
            };
            read_observation(adapter, device_id.device)
                .await
                .unwrap_or_else(|error| {
                    debug!(%error, "failed to read advertisement");
                    None
                })
        })
        .await;
    });

    Ok(rx)
}

/// Forward observations read from `events` until the stream ends or the
/// receiving side of `tx` goes away, whichever comes first.
async fn forward<S, F, Fut>(mut events: S, tx: mpsc::Sender<Observation>, mut read: F)
where
    S: Stream + Unpin,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Option<Observation>>,
{
    loop {
        let event = tokio::select! {
            _ = tx.closed() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Some(observation) = read(event).await
            && tx.send(observation).await.is_err()
        {
            break;
        }
    }
    trace!("bluer scan stopped");
}

/// Read the Victron manufacturer data of a discovered device, if any.
async fn read_observation(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Observation>, ScanError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };

    Ok(manufacturer_data
        .get(&VICTRON_MANUFACTURER_ID)
        .map(|data| Observation::new(DeviceIdentity::from(address).to_string(), data.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_address_to_identity() {
        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let identity: DeviceIdentity = addr.into();
        assert_eq!(identity.as_str(), "aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn test_forward_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(forward(futures::stream::pending::<u8>(), tx, |_| async {
            None
        }));
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scan task outlived its receiver")
            .unwrap();
    }

    #[tokio::test]
    async fn test_forward_sends_read_observations() {
        let (tx, mut rx) = mpsc::channel(4);
        let events = futures::stream::iter([1u8, 2, 3]);
        forward(events, tx, |n| async move {
            (n != 2).then(|| Observation::new("aa:bb:cc:dd:ee:ff", vec![n]))
        })
        .await;

        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![3]);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_pattern_bytes_match_company_id() {
        assert_eq!(
            u16::from_le_bytes(VICTRON_MANUFACTURER_ID_BYTES),
            VICTRON_MANUFACTURER_ID
        );
    }
}
