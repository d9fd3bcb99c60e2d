//! MQTT transport built on `rumqttc`.
//!
//! `rumqttc` splits a connection into a client handle and an event loop that
//! must be polled for anything to happen. [`MqttPublisher::connect`] polls the
//! loop until the broker acknowledges the connection, then hands it to a
//! background task that keeps the session alive and reconnects after
//! failures. The task tracks whether the broker session is up; publishing
//! while it is down fails right away instead of queueing.

use super::{DisconnectFuture, PublishError, PublishFuture, Publisher};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Upper bound on the initial connection handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Connection-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to MQTT broker: {0}")]
    Connect(String),
    #[error("MQTT broker refused connection: {0}")]
    Refused(String),
    #[error("MQTT broker did not acknowledge connection within {0:?}")]
    Timeout(Duration),
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(&self.username, &self.password);
        options
    }
}

/// A connected MQTT client with its event loop running in the background.
#[derive(Debug)]
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Connect and wait for the broker's acknowledgement.
    ///
    /// # Errors
    /// Any failure before a successful CONNACK, including a timeout, is a
    /// `TransportError`.
    pub async fn connect(
        settings: &MqttSettings,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        info!(host = %settings.host, port = settings.port, "connecting to MQTT broker");

        let (client, mut eventloop) =
            AsyncClient::new(settings.options(), REQUEST_CHANNEL_CAPACITY);
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        info!("connected to MQTT broker");
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let event_loop = tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&connected),
            cancel.clone(),
        ));

        Ok(Self {
            client,
            connected,
            cancel,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    /// Whether the broker session is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send DISCONNECT and stop the background event loop.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) {
        let Some(mut event_loop) = self.event_loop.lock().ok().and_then(|mut h| h.take()) else {
            return;
        };

        self.connected.store(false, Ordering::SeqCst);
        if let Err(error) = self.client.disconnect().await {
            debug!(%error, "failed to queue MQTT disconnect");
        }

        // Give the event loop a moment to flush the DISCONNECT packet.
        if tokio::time::timeout(DISCONNECT_GRACE, &mut event_loop)
            .await
            .is_err()
        {
            self.cancel.cancel();
            let _ = event_loop.await;
        }
        info!("disconnected from MQTT broker");
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> PublishFuture<'_> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(PublishError::Client("not connected to MQTT broker".to_string()));
            }
            self.client
                .publish(topic, QoS::AtLeastOnce, retain, payload)
                .await
                .map_err(|e| PublishError::Client(e.to_string()))
        })
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(self.close())
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Refused(format!("{code:?}"))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Poll the event loop until cancelled or a DISCONNECT has been sent.
///
/// Connection errors clear `connected` and are retried after a delay;
/// `rumqttc` reconnects on the next poll and a fresh CONNACK sets it again.
async fn run_event_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        connected.store(true, Ordering::SeqCst);
                        info!("reconnected to MQTT broker");
                    } else {
                        warn!(code = ?ack.code, "MQTT broker refused reconnection");
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!(pkid = ack.pkid, "publish acknowledged");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(error) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        warn!(%error, "lost connection to MQTT broker");
                    } else {
                        debug!(%error, "MQTT reconnect failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            },
        }
    }
    connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}
