//! Two devices at 30 fps reporting with a few milliseconds of jitter for ten seconds.

use pdc_core::concentrator::{Concentrator, ConcentratorSettings};
use pdc_core::measurement::{ManualClock, Ticks, TICKS_PER_MILLISECOND, TICKS_PER_SECOND};
use pdc_core::model::{CellStatus, Frame, SignalMap};
use pdc_core::random::{frame_measurements, random_configuration, random_frame};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const T0: Ticks = 1_700_000_000 * TICKS_PER_SECOND;
const FPS: u16 = 30;
const FRAMES: i64 = 300;

fn source_timestamp(i: i64) -> Ticks {
    T0 + i * TICKS_PER_SECOND / FPS as i64
}

#[test]
fn test_two_devices_produce_complete_ordered_frames() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let config = random_configuration(1, FPS, 2, &mut rng);
    let clock = Arc::new(ManualClock::new(T0));
    let (concentrator, frames) = Concentrator::new(
        ConcentratorSettings::new(FPS as u32, 3.0, 9.0),
        config.clone(),
        SignalMap::standard(&config),
        clock.clone(),
    )
    .unwrap();

    let mut sent = Vec::new();
    for i in 0..FRAMES {
        let timestamp = source_timestamp(i);
        clock.set(timestamp);
        let frame = random_frame(&config, timestamp, &mut rng);

        // Device B reports before device A half of the time.
        let mut measurements = frame_measurements(&config, &frame);
        if rng.random_bool(0.5) {
            measurements.reverse();
        }
        for m in measurements.iter_mut() {
            let jitter = rng.random_range(-5 * TICKS_PER_MILLISECOND..=5 * TICKS_PER_MILLISECOND);
            *m = m.restamped(m.timestamp + jitter);
        }
        concentrator.sort_measurements(&measurements);
        concentrator.publish_ready_frames();
        sent.push(frame);
    }

    clock.advance(10 * TICKS_PER_SECOND);
    concentrator.publish_ready_frames();
    assert_eq!(concentrator.open_frames(), 0);

    let published: Vec<Frame> = frames.try_iter().collect();
    assert_eq!(published.len(), FRAMES as usize);

    for (i, frame) in published.iter().enumerate() {
        assert!(frame.published);
        assert_eq!(frame.cells.len(), 2);
        for cell in &frame.cells {
            assert!(!cell.status.contains(CellStatus::NO_DATA), "frame {} has a missing cell", i);
        }
        for (cell, expected) in frame.cells.iter().zip(&sent[i].cells) {
            assert_eq!(cell.frequency, expected.frequency);
            assert_eq!(cell.analogs, expected.analogs);
        }
    }

    for pair in published.windows(2) {
        let step = pair[1].timestamp - pair[0].timestamp;
        assert!((333_333..=333_334).contains(&step), "step of {} ticks", step);
    }
    assert_eq!(published[0].timestamp, T0);

    let stats = concentrator.statistics();
    assert_eq!(stats.discarded_measurements, 0);
    assert_eq!(stats.published_frames, FRAMES as u64);
    assert_eq!(
        stats.processed_measurements,
        FRAMES as u64 * config.measurement_count() as u64
    );
}

#[test]
fn test_lagging_device_is_published_without_its_cell() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = random_configuration(1, FPS, 2, &mut rng);
    let clock = Arc::new(ManualClock::new(T0));
    let (concentrator, frames) = Concentrator::new(
        ConcentratorSettings::new(FPS as u32, 1.0, 9.0),
        config.clone(),
        SignalMap::standard(&config),
        clock.clone(),
    )
    .unwrap();
    let first_device = config.cells[0].id_label.clone();

    // Only the first device reports for two seconds.
    for i in 0..60 {
        let timestamp = source_timestamp(i);
        clock.set(timestamp);
        let frame = random_frame(&config, timestamp, &mut rng);
        let measurements: Vec<_> = frame_measurements(&config, &frame)
            .into_iter()
            .filter(|m| m.key.source == first_device)
            .collect();
        assert!(!measurements.is_empty());
        concentrator.sort_measurements(&measurements);
        concentrator.publish_ready_frames();
    }

    let published: Vec<Frame> = frames.try_iter().collect();
    // Frames older than the one second lag are out; the rest are still waiting.
    assert!(published.len() >= 29 && published.len() <= 31, "{}", published.len());
    for frame in &published {
        assert!(!frame.cells[0].status.contains(CellStatus::NO_DATA));
        assert!(frame.cells[1].status.contains(CellStatus::NO_DATA));
    }

    // A straggler for an already published frame is discarded.
    let late = frame_measurements(&config, &random_frame(&config, T0, &mut rng));
    let before = concentrator.statistics().discarded_measurements;
    concentrator.sort_measurements(&late);
    assert!(concentrator.statistics().discarded_measurements > before);
}
