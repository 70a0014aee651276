use crate::measurement::{Measurement, Ticks};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live counters, updated lock-free from the sorting and publishing threads.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub discarded: AtomicU64,
    pub downsampled: AtomicU64,
    pub sorted_by_arrival: AtomicU64,
    pub missed_sorts_by_timeout: AtomicU64,
    pub published_frames: AtomicU64,
    pub published_measurements: AtomicU64,
    pub frames_ahead_of_schedule: AtomicU64,
    pub last_discarded_latency: AtomicI64,
    last_discarded: Mutex<Option<Measurement>>,
    discards_by_source: Mutex<BTreeMap<String, u64>>,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_discard(&self, measurement: &Measurement, real_time: Ticks) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.last_discarded_latency
            .store(real_time - measurement.timestamp, Ordering::Relaxed);
        *self.last_discarded.lock() = Some(measurement.clone());
        *self
            .discards_by_source
            .lock()
            .entry(measurement.key.source.clone())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self, expected_measurements: usize) -> ConcentratorStatistics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let published_frames = load(&self.published_frames);
        let published_measurements = load(&self.published_measurements);
        let expected_total = published_frames * expected_measurements as u64;
        let measurement_loss_percent = if expected_total == 0 {
            0.0
        } else {
            100.0 * (1.0 - published_measurements as f64 / expected_total as f64)
        };

        ConcentratorStatistics {
            received_measurements: load(&self.received),
            processed_measurements: load(&self.processed),
            discarded_measurements: load(&self.discarded),
            downsampled_measurements: load(&self.downsampled),
            measurements_sorted_by_arrival: load(&self.sorted_by_arrival),
            missed_sorts_by_timeout: load(&self.missed_sorts_by_timeout),
            published_frames,
            published_measurements,
            frames_ahead_of_schedule: load(&self.frames_ahead_of_schedule),
            expected_measurements,
            measurement_loss_percent,
            last_discarded_measurement: self.last_discarded.lock().clone(),
            last_discarded_latency: self.last_discarded_latency.load(Ordering::Relaxed),
            discards_by_source: self.discards_by_source.lock().clone(),
        }
    }
}

/// Point-in-time copy of the concentrator counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcentratorStatistics {
    pub received_measurements: u64,
    pub processed_measurements: u64,
    pub discarded_measurements: u64,
    pub downsampled_measurements: u64,
    pub measurements_sorted_by_arrival: u64,
    /// Measurements that found their frame already published.
    pub missed_sorts_by_timeout: u64,
    pub published_frames: u64,
    pub published_measurements: u64,
    pub frames_ahead_of_schedule: u64,
    /// Measurements a complete frame carries.
    pub expected_measurements: usize,
    pub measurement_loss_percent: f64,
    pub last_discarded_measurement: Option<Measurement>,
    /// Real time minus the last discarded measurement's timestamp, in ticks.
    pub last_discarded_latency: Ticks,
    pub discards_by_source: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementKey;

    #[test]
    fn test_snapshot_computes_loss() {
        let counters = Counters::default();
        Counters::add(&counters.published_frames, 10);
        Counters::add(&counters.published_measurements, 75);
        let stats = counters.snapshot(10);
        assert!((stats.measurement_loss_percent - 25.0).abs() < 1e-9);
        assert_eq!(Counters::default().snapshot(10).measurement_loss_percent, 0.0);
    }

    #[test]
    fn test_discards_are_tracked_per_source() {
        let counters = Counters::default();
        let late = Measurement::new(MeasurementKey::new("PMU_A", 1), 100, 1.0);
        counters.record_discard(&late, 350);
        counters.record_discard(&late, 400);
        counters.record_discard(&Measurement::new(MeasurementKey::new("PMU_B", 0), 0, 1.0), 10);

        let stats = counters.snapshot(1);
        assert_eq!(stats.discarded_measurements, 3);
        assert_eq!(stats.discards_by_source.get("PMU_A"), Some(&2));
        assert_eq!(stats.last_discarded_latency, 10);
        assert_eq!(stats.last_discarded_measurement.unwrap().key.source, "PMU_B");
    }
}
