//! Ordered buckets of open frames.
//!
//! The map lock is held only to look up, insert or remove a bucket; values are written
//! under the bucket's own lock so sorting into different slots never contends.

use super::settings::DownsamplingMethod;
use crate::measurement::{Measurement, MeasurementKey, Ticks, TICKS_PER_SECOND};
use crate::model::{CellStatus, Frame, SignalTarget};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Assignment {
    timestamp: Ticks,
    rank: u8,
}

/// What happened to a measurement offered to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SortOutcome {
    Assigned,
    /// The signal already had a value; `applied` tells whether the new one replaced it.
    Downsampled { applied: bool },
    /// The bucket was published before the measurement got to it.
    AlreadyPublished,
    /// The target field does not exist in the cell.
    Rejected,
}

#[derive(Debug)]
struct BucketState {
    frame: Frame,
    published: bool,
    assignments: HashMap<MeasurementKey, Assignment>,
    touched: Vec<bool>,
}

#[derive(Debug)]
pub(crate) struct Bucket {
    pub timestamp: Ticks,
    /// Local clock time when the bucket was opened.
    pub created: Ticks,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(frame: Frame, created: Ticks) -> Self {
        let touched = vec![false; frame.cells.len()];
        Bucket {
            timestamp: frame.timestamp,
            created,
            state: Mutex::new(BucketState {
                frame,
                published: false,
                assignments: HashMap::new(),
                touched,
            }),
        }
    }

    /// Writes `measurement` into `target`, resolving repeats with `method`.
    /// `timestamp` is the measurement time after any sort-by-arrival substitution.
    pub fn assign(
        &self,
        measurement: &Measurement,
        timestamp: Ticks,
        target: SignalTarget,
        method: DownsamplingMethod,
    ) -> SortOutcome {
        let mut state = self.state.lock();
        if state.published {
            return SortOutcome::AlreadyPublished;
        }

        let candidate = Assignment {
            timestamp,
            rank: measurement.state_flags.quality_rank(),
        };
        let outcome = match state.assignments.get(&measurement.key) {
            None => SortOutcome::Assigned,
            Some(previous) => SortOutcome::Downsampled {
                applied: self.prefer(candidate, *previous, method),
            },
        };
        if matches!(outcome, SortOutcome::Downsampled { applied: false }) {
            return outcome;
        }

        let Some(cell) = state.frame.cells.get_mut(target.cell) else {
            return SortOutcome::Rejected;
        };
        if !cell.apply(target.field, measurement.value) {
            return SortOutcome::Rejected;
        }
        state.touched[target.cell] = true;
        state.assignments.insert(measurement.key.clone(), candidate);
        outcome
    }

    fn prefer(&self, candidate: Assignment, previous: Assignment, method: DownsamplingMethod) -> bool {
        let distance = |a: Assignment| (a.timestamp - self.timestamp).abs();
        match method {
            DownsamplingMethod::LastReceived => true,
            DownsamplingMethod::Closest => distance(candidate) < distance(previous),
            DownsamplingMethod::BestQuality => {
                candidate.rank < previous.rank
                    || (candidate.rank == previous.rank && distance(candidate) < distance(previous))
            }
        }
    }

    /// Number of distinct signals sorted into this bucket.
    pub fn sorted_measurements(&self) -> usize {
        self.state.lock().assignments.len()
    }

    /// Seals the bucket and returns its frame. Cells that received nothing are flagged
    /// as having no data.
    pub fn publish(&self) -> Frame {
        let mut state = self.state.lock();
        state.published = true;
        let BucketState { frame, touched, .. } = &mut *state;
        for (cell, touched) in frame.cells.iter_mut().zip(touched.iter()) {
            if !*touched {
                cell.status.set(CellStatus::NO_DATA);
            }
        }
        frame.published = true;
        frame.clone()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    buckets: BTreeMap<Ticks, Arc<Bucket>>,
    last_published: Option<Ticks>,
}

#[derive(Debug)]
pub(crate) struct FrameQueue {
    ticks_per_frame: f64,
    time_resolution: Ticks,
    state: Mutex<QueueState>,
}

impl FrameQueue {
    pub fn new(frames_per_second: u32, time_resolution: Ticks) -> Self {
        FrameQueue {
            ticks_per_frame: TICKS_PER_SECOND as f64 / frames_per_second as f64,
            time_resolution,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Truncates `timestamp` to the time resolution, then rounds it to the nearest
    /// frame slot.
    pub fn round(&self, timestamp: Ticks) -> Ticks {
        let timestamp = if self.time_resolution > 0 {
            timestamp - timestamp.rem_euclid(self.time_resolution)
        } else {
            timestamp
        };
        let offset = timestamp.rem_euclid(TICKS_PER_SECOND);
        let second = timestamp - offset;
        let index = (offset as f64 / self.ticks_per_frame).round();
        second + (index * self.ticks_per_frame).round() as Ticks
    }

    /// Finds or opens the bucket for `timestamp`. Returns `None` when the slot is not
    /// newer than the last published frame.
    pub fn get_frame(
        &self,
        timestamp: Ticks,
        created: Ticks,
        new_frame: impl FnOnce(Ticks) -> Frame,
    ) -> Option<Arc<Bucket>> {
        let slot = self.round(timestamp);
        let mut state = self.state.lock();
        if state.last_published.is_some_and(|last| slot <= last) {
            return None;
        }
        let bucket = state
            .buckets
            .entry(slot)
            .or_insert_with(|| Arc::new(Bucket::new(new_frame(slot), created)));
        Some(Arc::clone(bucket))
    }

    /// The oldest open bucket.
    pub fn head(&self) -> Option<Arc<Bucket>> {
        self.state
            .lock()
            .buckets
            .first_key_value()
            .map(|(_, bucket)| Arc::clone(bucket))
    }

    /// Removes the bucket at `timestamp` for publication and closes every slot up to
    /// it, in one step under the map lock.
    ///
    /// Fails when an older bucket was opened after `head` returned this one; the caller
    /// must look at the new head first.
    pub fn claim(&self, timestamp: Ticks) -> bool {
        let mut state = self.state.lock();
        match state.buckets.first_key_value() {
            Some((&first, _)) if first == timestamp => {}
            _ => return false,
        }
        state.buckets.remove(&timestamp);
        state.last_published = Some(timestamp);
        true
    }

    #[cfg(test)]
    pub fn last_published(&self) -> Option<Ticks> {
        self.state.lock().last_published
    }

    pub fn len(&self) -> usize {
        self.state.lock().buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigurationCell, ConfigurationFrame, PhasorKind, SignalField};
    use crate::measurement::StateFlags;

    fn config() -> ConfigurationFrame {
        ConfigurationFrame::new(1, 30)
            .with_cell(ConfigurationCell::new(10, "A", "A").with_phasor("V", PhasorKind::Voltage, 1))
            .with_cell(ConfigurationCell::new(20, "B", "B"))
    }

    const FREQUENCY: SignalTarget = SignalTarget {
        cell: 0,
        field: SignalField::Frequency,
    };

    #[test]
    fn test_round_to_nearest_slot() {
        let queue = FrameQueue::new(30, 0);
        let base = 100 * TICKS_PER_SECOND;
        assert_eq!(queue.round(base + 40_000), base);
        assert_eq!(queue.round(base + 333_333 - 40_000), base + 333_333);
        assert_eq!(queue.round(base - 40_000), base);
        // The last slot of a second rounds up into the next second.
        assert_eq!(queue.round(base + TICKS_PER_SECOND - 100), base + TICKS_PER_SECOND);

        let coarse = FrameQueue::new(30, TICKS_PER_SECOND);
        assert_eq!(coarse.round(base + 9_999_999), base);
    }

    #[test]
    fn test_published_slots_are_closed() {
        let config = config();
        let queue = FrameQueue::new(30, 0);
        let slot = 10 * TICKS_PER_SECOND;
        let bucket = queue.get_frame(slot + 1, 0, |t| config.empty_frame(t)).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.head().unwrap().timestamp, slot);

        assert!(queue.claim(slot));
        bucket.publish();
        assert_eq!(queue.last_published(), Some(slot));
        assert!(queue.get_frame(slot, 0, |t| config.empty_frame(t)).is_none());
        assert!(queue.get_frame(slot - TICKS_PER_SECOND, 0, |t| config.empty_frame(t)).is_none());
        assert!(queue.get_frame(slot + TICKS_PER_SECOND, 0, |t| config.empty_frame(t)).is_some());

        let late = Measurement::new(MeasurementKey::new("A", 2), slot, 60.0);
        assert_eq!(
            bucket.assign(&late, slot, FREQUENCY, DownsamplingMethod::LastReceived),
            SortOutcome::AlreadyPublished
        );
    }

    #[test]
    fn test_claim_refuses_when_an_older_bucket_arrived() {
        let config = config();
        let queue = FrameQueue::new(30, 0);
        let t1 = 10 * TICKS_PER_SECOND;
        let t2 = t1 + 333_333;

        queue.get_frame(t2, 0, |t| config.empty_frame(t)).unwrap();
        let head = queue.head().unwrap();
        assert_eq!(head.timestamp, t2);

        // A sorter opens an older slot between choosing the head and claiming it.
        queue.get_frame(t1, 0, |t| config.empty_frame(t)).unwrap();
        assert!(!queue.claim(head.timestamp));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.head().unwrap().timestamp, t1);
        assert!(queue.claim(t1));
        assert!(queue.claim(t2));
        assert_eq!(queue.last_published(), Some(t2));
        assert!(queue.get_frame(t1, 0, |t| config.empty_frame(t)).is_none());
        assert!(!queue.claim(t2));
    }

    #[test]
    fn test_publish_flags_silent_cells() {
        let config = config();
        let bucket = Bucket::new(config.empty_frame(0), 0);
        let m = Measurement::new(MeasurementKey::new("A", 2), 0, 60.0);
        assert_eq!(
            bucket.assign(&m, 0, FREQUENCY, DownsamplingMethod::LastReceived),
            SortOutcome::Assigned
        );
        let frame = bucket.publish();
        assert!(frame.published);
        assert!(!frame.cells[0].status.contains(CellStatus::NO_DATA));
        assert!(frame.cells[1].status.contains(CellStatus::NO_DATA));
        assert_eq!(frame.cells[0].frequency, 60.0);
    }

    #[test]
    fn test_downsampling_methods() {
        let config = config();
        let key = MeasurementKey::new("A", 2);
        let far = Measurement::new(key.clone(), 30_000, 59.0);
        let near = Measurement::new(key.clone(), 5_000, 60.0);
        let bad = Measurement::new(key.clone(), 0, 61.0).with_flags(StateFlags::BAD_DATA);

        let closest = Bucket::new(config.empty_frame(0), 0);
        closest.assign(&near, near.timestamp, FREQUENCY, DownsamplingMethod::Closest);
        assert_eq!(
            closest.assign(&far, far.timestamp, FREQUENCY, DownsamplingMethod::Closest),
            SortOutcome::Downsampled { applied: false }
        );
        assert_eq!(closest.publish().cells[0].frequency, 60.0);

        let last = Bucket::new(config.empty_frame(0), 0);
        last.assign(&near, near.timestamp, FREQUENCY, DownsamplingMethod::LastReceived);
        assert_eq!(
            last.assign(&far, far.timestamp, FREQUENCY, DownsamplingMethod::LastReceived),
            SortOutcome::Downsampled { applied: true }
        );
        assert_eq!(last.publish().cells[0].frequency, 59.0);
        assert_eq!(last.sorted_measurements(), 1);

        let best = Bucket::new(config.empty_frame(0), 0);
        best.assign(&far, far.timestamp, FREQUENCY, DownsamplingMethod::BestQuality);
        assert_eq!(
            best.assign(&bad, bad.timestamp, FREQUENCY, DownsamplingMethod::BestQuality),
            SortOutcome::Downsampled { applied: false }
        );
        assert_eq!(
            best.assign(&near, near.timestamp, FREQUENCY, DownsamplingMethod::BestQuality),
            SortOutcome::Downsampled { applied: true }
        );
        assert_eq!(best.publish().cells[0].frequency, 60.0);
    }
}
