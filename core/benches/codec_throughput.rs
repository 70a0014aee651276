// Encode/decode throughput of data frames for each protocol, and concentrator sorting
// throughput for a growing number of devices.
//
// The interesting case is a 60 fps stream of 100 devices: one second of it is 6000
// data frames' worth of measurements, and sorting must keep well ahead of that.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pdc_core::codec::{codec_for, DataFrameOptions, PhasorProtocol};
use pdc_core::concentrator::{Concentrator, ConcentratorSettings};
use pdc_core::measurement::{ManualClock, Ticks, TICKS_PER_SECOND};
use pdc_core::model::SignalMap;
use pdc_core::random::{frame_measurements, random_configuration, random_frame};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;

const T0: Ticks = 1_700_000_000 * TICKS_PER_SECOND;

const PROTOCOLS: [PhasorProtocol; 3] = [
    PhasorProtocol::IeeeC37_118V1,
    PhasorProtocol::IeeeC37_118V2,
    PhasorProtocol::Iec61850_90_5,
];

fn bench_data_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame_codec");
    group.measurement_time(Duration::from_secs(10));
    let mut rng = StdRng::seed_from_u64(1);

    for &devices in &[1usize, 10, 100] {
        let config = random_configuration(1, 60, devices, &mut rng);
        let frame = random_frame(&config, T0, &mut rng);

        for protocol in PROTOCOLS {
            let codec = codec_for(protocol);
            let encoded = codec
                .encode_data_frame(&config, &frame, DataFrameOptions::default())
                .unwrap();
            group.throughput(Throughput::Bytes(encoded.len() as u64));

            group.bench_with_input(
                BenchmarkId::new(format!("encode_{}", protocol), devices),
                &devices,
                |b, _| {
                    b.iter(|| {
                        codec
                            .encode_data_frame(
                                black_box(&config),
                                black_box(&frame),
                                DataFrameOptions::default(),
                            )
                            .unwrap()
                    });
                },
            );

            group.bench_with_input(
                BenchmarkId::new(format!("decode_{}", protocol), devices),
                &devices,
                |b, _| {
                    b.iter(|| codec.decode(black_box(&encoded), Some(&config), true).unwrap());
                },
            );
        }
    }

    group.finish();
}

fn bench_concentrator_sorting(c: &mut Criterion) {
    let mut group = c.benchmark_group("concentrator_sorting");
    group.measurement_time(Duration::from_secs(10));
    let mut rng = StdRng::seed_from_u64(2);

    for &devices in &[10usize, 100] {
        let config = random_configuration(1, 60, devices, &mut rng);
        let frames: Vec<_> = (0..60)
            .map(|i| {
                let frame = random_frame(&config, T0 + i * TICKS_PER_SECOND / 60, &mut rng);
                frame_measurements(&config, &frame)
            })
            .collect();
        let measurements: usize = frames.iter().map(Vec::len).sum();
        group.throughput(Throughput::Elements(measurements as u64));

        group.bench_with_input(BenchmarkId::new("one_second", devices), &devices, |b, _| {
            b.iter(|| {
                let clock = Arc::new(ManualClock::new(T0));
                let (concentrator, output) = Concentrator::new(
                    ConcentratorSettings::new(60, 2.0, 2.0),
                    config.clone(),
                    SignalMap::standard(&config),
                    clock,
                )
                .unwrap();
                for measurements in &frames {
                    concentrator.sort_measurements(measurements);
                    concentrator.publish_ready_frames();
                }
                black_box(output.try_iter().count())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_data_frame_codec, bench_concentrator_sorting);
criterion_main!(benches);
