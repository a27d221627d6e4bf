//! Broadcast decode benchmarks
//!
//! Measures E1.31 parsing alone and the full datagram to field-update path
//! for channel maps of increasing size.
//!
//! Run with: cargo bench --bench decode

use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use epsilon_bridge::channel_map::catalog::CATALOG;
use epsilon_bridge::channel_map::{ChannelMap, ChannelMapConfig};
use epsilon_bridge::metrics::Metrics;
use epsilon_bridge::net::decoder::{BroadcastDecoder, DecoderSettings, FrameVerdict};
use epsilon_bridge::net::sacn::{self, DataPacketSpec};
use rand::Rng;

const UNIVERSE: u16 = 2;

/// One packet per sequence number so every decode passes sequence tracking
fn packets(slot_count: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..=255u8)
        .map(|sequence| {
            let slots: Vec<u8> = (0..slot_count).map(|_| rng.gen()).collect();
            sacn::encode_data_packet(&DataPacketSpec {
                sequence,
                universe: UNIVERSE,
                slots: &slots,
                ..DataPacketSpec::default()
            })
        })
        .collect()
}

fn channel_map(variables: usize) -> Arc<ChannelMap> {
    let config = ChannelMapConfig {
        universe: UNIVERSE,
        variables: CATALOG.iter().take(variables).map(|e| e.name.to_string()).collect(),
        ..ChannelMapConfig::default()
    };
    Arc::new(ChannelMap::generate(&config).expect("valid benchmark channel map"))
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("sacn_parse");

    for slot_count in [16usize, 50, 512] {
        let packets = packets(slot_count);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("slots", slot_count), &packets, |b, packets| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % packets.len();
                black_box(sacn::parse(black_box(&packets[i])).is_ok())
            });
        });
    }

    group.finish();
}

fn bench_decode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");

    for variables in [4usize, 12, CATALOG.len()] {
        let packets = packets(50);
        let settings = DecoderSettings {
            universe: UNIVERSE,
            ..DecoderSettings::default()
        };
        let (mut decoder, _link) = BroadcastDecoder::new(settings, channel_map(variables), Arc::new(Metrics::new()));

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("variables", variables), |b| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % packets.len();
                match decoder.decode_frame(black_box(&packets[i]), Instant::now()) {
                    FrameVerdict::Frame(frame) => black_box(frame.updates.len()),
                    _ => 0,
                }
            });
        });
    }

    group.finish();
}

fn bench_corrupt(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let garbage: Vec<Vec<u8>> = (0..256)
        .map(|_| {
            let len = rng.gen_range(0..sacn::DATA_HEADER_LEN + 64);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect();

    c.bench_function("sacn_parse_garbage", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % garbage.len();
            black_box(sacn::parse(black_box(&garbage[i])).is_err())
        });
    });
}

criterion_group!(benches, bench_parse, bench_decode_frame, bench_corrupt);
criterion_main!(benches);
