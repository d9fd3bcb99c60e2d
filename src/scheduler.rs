//! Supervisor: connect, discover, then publish on a fixed interval until
//! shutdown.

use crate::broker::mqtt::{CONNECT_TIMEOUT, MqttPublisher, TransportError};
use crate::broker::{BrokerSink, Publisher};
use crate::config::Settings;
use crate::cycle::{CycleOutcome, run_cycle};
use crate::discovery::{DiscoveryError, Session, discover};
use crate::key::DeviceBinding;
use crate::scanner::Radio;
use crate::telemetry::{Codec, TelemetryDecoder};
use crate::victron::VictronCodec;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fatal errors; each one ends the process with a nonzero status.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Lifecycle of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    DiscoveringDevice,
    Running,
    DiscoveryFailed,
    ShuttingDown,
    Stopped,
}

/// Timing and recovery knobs for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub interval: Duration,
    pub scan_window: Duration,
    pub refresh_window: Option<Duration>,
    pub rediscover_after: Option<u32>,
}

impl From<&Settings> for Schedule {
    fn from(settings: &Settings) -> Self {
        Self {
            interval: settings.interval,
            scan_window: settings.scan_window,
            refresh_window: settings.refresh_window,
            rediscover_after: settings.rediscover_after,
        }
    }
}

/// Owns the session and the sink for the lifetime of the process.
pub struct Supervisor<'a, C, P> {
    radio: &'a dyn Radio,
    binding: DeviceBinding,
    schedule: Schedule,
    decoder: TelemetryDecoder<C>,
    sink: BrokerSink<P>,
    session: Session,
    phase: Phase,
    decode_failures: u32,
}

impl<'a, C: Codec, P: Publisher> Supervisor<'a, C, P> {
    pub fn new(
        radio: &'a dyn Radio,
        binding: DeviceBinding,
        schedule: Schedule,
        decoder: TelemetryDecoder<C>,
        sink: BrokerSink<P>,
    ) -> Self {
        Self {
            radio,
            binding,
            schedule,
            decoder,
            sink,
            session: Session::new(),
            phase: Phase::Starting,
            decode_failures: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn sink(&self) -> &BrokerSink<P> {
        &self.sink
    }

    /// Discover the device, then run cycles until `cancel` fires.
    ///
    /// The broker connection is released on every exit path.
    ///
    /// # Errors
    /// `RunError::Discovery` when the device is not found or the radio fails
    /// during startup. Cancellation is a clean exit.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), RunError> {
        self.phase = Phase::DiscoveringDevice;
        info!(
            device = %self.binding.identity,
            window = ?self.schedule.scan_window,
            "scanning for device"
        );

        match discover(self.radio, &self.binding, self.schedule.scan_window, cancel).await {
            Ok(raw) => self.session = Session::from(raw),
            Err(DiscoveryError::Cancelled) => {
                self.shutdown().await;
                return Ok(());
            }
            Err(e) => {
                self.phase = Phase::DiscoveryFailed;
                error!(error = %e, "device discovery failed");
                self.sink.close().await;
                return Err(e.into());
            }
        }

        self.phase = Phase::Running;
        info!(interval = ?self.schedule.interval, "publishing device data");

        let mut ticker = tokio::time::interval(self.schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick(cancel).await;
        }

        self.shutdown().await;
        Ok(())
    }

    /// One scheduled cycle, with the optional refresh scan before it and the
    /// optional re-discovery after it.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        if let Some(window) = self.schedule.refresh_window {
            self.refresh(window, cancel).await;
            if cancel.is_cancelled() {
                return CycleOutcome::Cancelled;
            }
        }

        let outcome = run_cycle(&self.session, &self.binding.key, &self.decoder, &self.sink).await;

        if outcome == CycleOutcome::DecodeFailed {
            self.decode_failures += 1;
            if let Some(limit) = self.schedule.rediscover_after
                && self.decode_failures >= limit
            {
                self.rediscover(cancel).await;
            }
        } else {
            self.decode_failures = 0;
        }
        outcome
    }

    async fn refresh(&mut self, window: Duration, cancel: &CancellationToken) {
        let previous = self.session.latest().cloned();
        match self
            .session
            .scan(self.radio, &self.binding, window, cancel)
            .await
        {
            Ok(raw) if Some(raw) == previous.as_ref() => {
                warn!("no fresh advertisement, reusing last payload");
            }
            Ok(_) => debug!("refreshed advertisement"),
            Err(DiscoveryError::Cancelled) => {}
            Err(error) => warn!(%error, "refresh scan failed, reusing last payload"),
        }
    }

    async fn rediscover(&mut self, cancel: &CancellationToken) {
        warn!(
            failures = self.decode_failures,
            "repeated decode failures, re-running discovery"
        );
        self.decode_failures = 0;

        match discover(self.radio, &self.binding, self.schedule.scan_window, cancel).await {
            Ok(raw) => {
                info!(identity = %raw.sender, "re-discovered device");
                self.session = Session::from(raw);
            }
            Err(DiscoveryError::Cancelled) => {}
            Err(error) => warn!(%error, "re-discovery failed, keeping previous payload"),
        }
    }

    async fn shutdown(&mut self) {
        self.phase = Phase::ShuttingDown;
        info!("shutting down");
        self.sink.close().await;
        self.phase = Phase::Stopped;
    }
}

/// Connect to the broker and run the Victron supervisor until `cancel` fires.
///
/// # Errors
/// A broker connection failure at startup or a failed discovery.
pub async fn run(
    settings: Settings,
    radio: &dyn Radio,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let publisher = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = MqttPublisher::connect(&settings.mqtt, CONNECT_TIMEOUT) => result?,
    };

    let schedule = Schedule::from(&settings);
    let mut supervisor = Supervisor::new(
        radio,
        settings.binding,
        schedule,
        TelemetryDecoder::new(VictronCodec),
        BrokerSink::new(publisher, settings.publish_timeout),
    );
    supervisor.run(&cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DEFAULT_PUBLISH_TIMEOUT;
    use crate::broker::tests::RecordingPublisher;
    use crate::discovery::RawAdvertisement;
    use crate::discovery::tests::{FakeRadio, binding};
    use crate::key::PresharedKey;
    use crate::scanner::Observation;
    use crate::telemetry::{FieldReading, FieldValue, Project};
    use crate::victron::DecodeError;
    use std::sync::atomic::Ordering;
    use tokio::time::sleep;

    /// Reads the first payload byte as tenths of a volt; an empty payload
    /// does not decode.
    struct VoltageCodec;

    struct Voltage(f64);

    impl Project for Voltage {
        fn fields(&self) -> Vec<FieldReading> {
            vec![FieldReading::new(
                "voltage",
                Ok(Some(FieldValue::Float(self.0))),
            )]
        }
    }

    impl Codec for VoltageCodec {
        type Record = Voltage;

        fn parse(&self, payload: &[u8], _key: &PresharedKey) -> Result<Voltage, DecodeError> {
            match payload.first() {
                Some(&tenths) => Ok(Voltage(f64::from(tenths) / 10.0)),
                None => Err(DecodeError::TooShort(0)),
            }
        }
    }

    fn schedule() -> Schedule {
        Schedule {
            interval: Duration::from_secs(30),
            scan_window: Duration::from_secs(5),
            refresh_window: None,
            rediscover_after: None,
        }
    }

    fn supervisor(
        radio: &FakeRadio,
        schedule: Schedule,
    ) -> Supervisor<'_, VoltageCodec, RecordingPublisher> {
        Supervisor::new(
            radio,
            binding(),
            schedule,
            TelemetryDecoder::new(VoltageCodec),
            BrokerSink::new(RecordingPublisher::default(), DEFAULT_PUBLISH_TIMEOUT),
        )
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            token.cancel();
        });
        cancel
    }

    fn combined_count(publisher: &RecordingPublisher) -> usize {
        publisher
            .messages()
            .iter()
            .filter(|(t, _, _)| t == "victron/mppt150_45/all")
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_is_fatal() {
        let radio = FakeRadio::new(vec![Observation::new("11:22:33:44:55:66", vec![131])]);
        let mut supervisor = supervisor(&radio, schedule());

        let err = supervisor.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Discovery(DiscoveryError::NotFound { .. })
        ));
        assert_eq!(supervisor.phase(), Phase::DiscoveryFailed);
        assert!(supervisor.sink().publisher().messages().is_empty());
        assert!(supervisor.sink().publisher().is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_discovered_device() {
        // configured as AA:BB:CC:DD:EE:FF, heard as aabbccddeeff
        let radio = FakeRadio::new(vec![Observation::new("aabbccddeeff", vec![131])]);
        let mut supervisor = supervisor(&radio, schedule());

        supervisor.run(&cancel_after(Duration::from_secs(10))).await.unwrap();
        assert_eq!(supervisor.phase(), Phase::Stopped);

        let publisher = supervisor.sink().publisher();
        assert_eq!(
            publisher.payload("victron/mppt150_45/voltage").as_deref(),
            Some("13.1")
        );
        let all: serde_json::Value =
            serde_json::from_str(&publisher.payload("victron/mppt150_45/all").unwrap()).unwrap();
        let keys: Vec<_> = all.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 2);
        assert!(all["timestamp"].is_string());
        assert_eq!(all["voltage"], 13.1);
        assert!(publisher.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_follow_interval() {
        let radio = FakeRadio::new(vec![Observation::new("AA:BB:CC:DD:EE:FF", vec![128])]);
        let mut supervisor = supervisor(&radio, schedule());

        // discovery ends at 5s; cycles at 5s, 35s and 65s
        supervisor.run(&cancel_after(Duration::from_secs(70))).await.unwrap();
        assert_eq!(combined_count(supervisor.sink().publisher()), 3);
        assert_eq!(radio.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_discovery() {
        let radio = FakeRadio::new(vec![]);
        let mut supervisor = supervisor(
            &radio,
            Schedule {
                scan_window: Duration::from_secs(3600),
                ..schedule()
            },
        );

        supervisor.run(&cancel_after(Duration::from_secs(1))).await.unwrap();
        assert_eq!(supervisor.phase(), Phase::Stopped);
        assert!(supervisor.sink().publisher().messages().is_empty());
        assert!(supervisor.sink().publisher().is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_reused_without_refresh() {
        let radio = FakeRadio::with_scans(vec![
            vec![Observation::new("aabbccddeeff", vec![120])],
            vec![Observation::new("aabbccddeeff", vec![140])],
        ]);
        let mut supervisor = supervisor(&radio, schedule());
        supervisor.run(&cancel_after(Duration::from_secs(40))).await.unwrap();

        let voltages: Vec<_> = supervisor
            .sink()
            .publisher()
            .messages()
            .into_iter()
            .filter(|(t, _, _)| t == "victron/mppt150_45/voltage")
            .map(|(_, p, _)| p)
            .collect();
        assert_eq!(voltages, ["12.0", "12.0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_window_picks_up_new_payload() {
        let radio = FakeRadio::with_scans(vec![
            vec![Observation::new("aabbccddeeff", vec![120])],
            vec![Observation::new("aabbccddeeff", vec![140])],
        ]);
        let mut supervisor = supervisor(
            &radio,
            Schedule {
                refresh_window: Some(Duration::from_secs(1)),
                ..schedule()
            },
        );
        let cancel = CancellationToken::new();
        supervisor.session = Session::from(RawAdvertisement {
            sender: binding().identity,
            payload: vec![120],
        });

        supervisor.tick(&cancel).await;
        assert_eq!(
            supervisor
                .sink()
                .publisher()
                .payload("victron/mppt150_45/voltage")
                .as_deref(),
            Some("12.0")
        );

        supervisor.tick(&cancel).await;
        assert_eq!(supervisor.session().latest().unwrap().payload, vec![140]);
        assert_eq!(radio.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_refresh_skips_publish() {
        let radio = FakeRadio::new(vec![]);
        let mut supervisor = supervisor(
            &radio,
            Schedule {
                refresh_window: Some(Duration::from_secs(3600)),
                ..schedule()
            },
        );
        supervisor.session = Session::from(RawAdvertisement {
            sender: binding().identity,
            payload: vec![120],
        });

        let outcome = supervisor.tick(&cancel_after(Duration::from_secs(1))).await;
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert!(supervisor.sink().publisher().messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovers_after_repeated_decode_failures() {
        let radio = FakeRadio::new(vec![Observation::new("aabbccddeeff", vec![125])]);
        let mut supervisor = supervisor(
            &radio,
            Schedule {
                rediscover_after: Some(2),
                ..schedule()
            },
        );
        let cancel = CancellationToken::new();
        supervisor.session = Session::from(RawAdvertisement {
            sender: binding().identity,
            payload: vec![],
        });

        assert_eq!(supervisor.tick(&cancel).await, CycleOutcome::DecodeFailed);
        assert_eq!(radio.started.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.tick(&cancel).await, CycleOutcome::DecodeFailed);
        assert_eq!(radio.started.load(Ordering::SeqCst), 1);

        let outcome = supervisor.tick(&cancel).await;
        assert!(matches!(outcome, CycleOutcome::Published(_)));
        assert_eq!(
            supervisor
                .sink()
                .publisher()
                .payload("victron/mppt150_45/voltage")
                .as_deref(),
            Some("12.5")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failures_publish_nothing_by_default() {
        let radio = FakeRadio::new(vec![Observation::new("aabbccddeeff", vec![])]);
        let mut supervisor = supervisor(&radio, schedule());

        supervisor.run(&cancel_after(Duration::from_secs(100))).await.unwrap();
        assert!(supervisor.sink().publisher().messages().is_empty());
        assert_eq!(radio.started.load(Ordering::SeqCst), 1);
    }
}
