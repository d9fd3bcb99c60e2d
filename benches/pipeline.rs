//! Benchmark for the advertisement processing pipeline.
//!
//! Runs encrypted solar charger payloads through decrypt -> decode -> batch
//! -> sink, with a publisher that discards everything it is given.

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::time::Duration;
use tokio::runtime::Runtime;
use victron_ble_mqtt::broker::{DisconnectFuture, PublishFuture};
use victron_ble_mqtt::victron::apply_keystream;
use victron_ble_mqtt::{
    BrokerSink, DeviceIdentity, PresharedKey, PublishBatch, Publisher, RawAdvertisement, Session,
    TelemetryDecoder, VictronCodec, run_cycle,
};

const KEY: PresharedKey = PresharedKey::new([
    0x0d, 0xf4, 0xd0, 0x39, 0x5b, 0x7d, 0x1a, 0x87, 0x6c, 0x0c, 0x33, 0xec, 0xb9, 0xe7, 0x0d, 0xcd,
]);

/// FLOAT, no error, 13.10 V, 5.2 A, 1230 Wh, 75 W, no load output
const PLAINTEXT: [u8; 12] = [
    0x05, 0x00, 0x1E, 0x05, 0x34, 0x00, 0x7B, 0x00, 0x4B, 0x00, 0xFF, 0x01,
];

fn advertisement(iv: u16) -> Vec<u8> {
    let mut body = PLAINTEXT.to_vec();
    apply_keystream(&KEY, iv, &mut body).unwrap();

    let [iv_lo, iv_hi] = iv.to_le_bytes();
    let mut payload = vec![0x10, 0x02, 0x56, 0xA0, 0x01, iv_lo, iv_hi, KEY.check_byte()];
    payload.extend(body);
    payload
}

struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, topic: String, payload: Vec<u8>, _retain: bool) -> PublishFuture<'_> {
        Box::pin(async move {
            black_box((topic, payload));
            Ok(())
        })
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(async {})
    }
}

/// Decrypt and decode a single advertisement
fn bench_decode(c: &mut Criterion) {
    let decoder = TelemetryDecoder::new(VictronCodec);
    let raw = RawAdvertisement {
        sender: "aa:bb:cc:dd:ee:ff".parse::<DeviceIdentity>().unwrap(),
        payload: advertisement(0x1234),
    };

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("solar_charger", |b| {
        b.iter(|| black_box(decoder.decode(black_box(&raw), &KEY).unwrap()))
    });
    group.finish();
}

/// Build the per-field payloads and the combined snapshot
fn bench_batch(c: &mut Criterion) {
    let decoder = TelemetryDecoder::new(VictronCodec);
    let raw = RawAdvertisement {
        sender: "aa:bb:cc:dd:ee:ff".parse::<DeviceIdentity>().unwrap(),
        payload: advertisement(0x1234),
    };
    let record = decoder.decode(&raw, &KEY).unwrap();

    c.bench_function("snapshot_json", |b| {
        b.iter(|| {
            let batch = PublishBatch::new(black_box(&record), Utc::now());
            black_box(batch.snapshot_json().unwrap())
        })
    });
}

/// Full cycles: decode -> batch -> publish to every topic
fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle");
    let rt = Runtime::new().unwrap();
    let decoder = TelemetryDecoder::new(VictronCodec);
    let sink = BrokerSink::new(NullPublisher, Duration::from_secs(5));

    for cycles in [1, 10, 100] {
        let sessions: Vec<Session> = (0..cycles)
            .map(|i| {
                Session::from(RawAdvertisement {
                    sender: "aa:bb:cc:dd:ee:ff".parse::<DeviceIdentity>().unwrap(),
                    payload: advertisement(i as u16),
                })
            })
            .collect();

        group.throughput(Throughput::Elements(cycles as u64));
        group.bench_with_input(BenchmarkId::from_parameter(cycles), &sessions, |b, sessions| {
            b.iter(|| {
                rt.block_on(async {
                    for session in sessions {
                        black_box(run_cycle(session, &KEY, &decoder, &sink).await);
                    }
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_batch, bench_cycle);
criterion_main!(benches);
