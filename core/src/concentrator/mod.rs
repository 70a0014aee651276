//! # Time-Aligned Frame Concentrator
//!
//! Sorts individually timestamped measurements into fixed-rate frames and publishes
//! each frame exactly once, in ascending timestamp order, when its lag time has
//! expired (or earlier, when preemptive publishing is on and the frame is complete).
//!
//! ## Key Components
//!
//! - `Concentrator`: Owns the open frames, the real-time estimate and the ticker thread.
//! - `ConcentratorSettings`: Output rate, lag/lead tolerances and sorting options.
//! - `ConcentratorStatistics`: Snapshot of the sorting and publication counters.
//!
//! ## Usage
//!
//! Measurements are sorted on the caller's thread through `sort_measurement`. Published
//! frames arrive on the `Receiver<Frame>` returned by `Concentrator::new`. Call `start`
//! to publish from a background ticker, or drive `publish_ready_frames` directly.

mod frame_queue;
mod settings;
mod statistics;

pub use settings::{ConcentratorError, ConcentratorSettings, DownsamplingMethod};
pub use statistics::ConcentratorStatistics;

use crate::measurement::{format_ticks, ticks_to_seconds, Clock, Measurement, StateFlags, Ticks};
use crate::model::{ConfigurationFrame, Frame, SignalMap};
use frame_queue::{FrameQueue, SortOutcome};
use parking_lot::Mutex;
use statistics::Counters;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace};

struct Shared {
    settings: ConcentratorSettings,
    config: ConfigurationFrame,
    signals: SignalMap,
    clock: Arc<dyn Clock>,
    queue: FrameQueue,
    real_time: AtomicI64,
    counters: Counters,
    output: Sender<Frame>,
    publish_lock: Mutex<()>,
    running: AtomicBool,
}

pub struct Concentrator {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Concentrator {
    /// Creates a concentrator for `config`, routing measurements through `signals`.
    ///
    /// # Returns
    ///
    /// The concentrator and the receiving end of its published-frame channel.
    pub fn new(
        settings: ConcentratorSettings,
        config: ConfigurationFrame,
        signals: SignalMap,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Receiver<Frame>), ConcentratorError> {
        settings.validate()?;
        let settings = settings.normalized();
        let (tx, rx) = mpsc::channel();

        let shared = Shared {
            queue: FrameQueue::new(settings.frames_per_second, settings.time_resolution),
            real_time: AtomicI64::new(clock.now()),
            settings,
            config,
            signals,
            clock,
            counters: Counters::default(),
            output: tx,
            publish_lock: Mutex::new(()),
            running: AtomicBool::new(false),
        };

        Ok((
            Concentrator {
                shared: Arc::new(shared),
                ticker: Mutex::new(None),
            },
            rx,
        ))
    }

    pub fn settings(&self) -> &ConcentratorSettings {
        &self.shared.settings
    }

    pub fn configuration(&self) -> &ConfigurationFrame {
        &self.shared.config
    }

    /// Best available estimate of "now".
    pub fn real_time(&self) -> Ticks {
        self.shared.real_time()
    }

    /// Seconds between real time and `timestamp`; positive for past timestamps.
    pub fn seconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        ticks_to_seconds(self.real_time() - timestamp)
    }

    pub fn sort_measurement(&self, measurement: &Measurement) {
        self.shared.sort(measurement);
    }

    pub fn sort_measurements<'a>(&self, measurements: impl IntoIterator<Item = &'a Measurement>) {
        for measurement in measurements {
            self.shared.sort(measurement);
        }
    }

    /// Publishes every frame that is due. Returns the number published.
    pub fn publish_ready_frames(&self) -> usize {
        self.shared.publish_ready_frames()
    }

    /// Number of frames still open.
    pub fn open_frames(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn statistics(&self) -> ConcentratorStatistics {
        self.shared.counters.snapshot(self.shared.signals.len())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Starts the publication ticker at the output frame rate.
    pub fn start(&self) -> Result<(), ConcentratorError> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let period = Duration::from_nanos(1_000_000_000 / shared.settings.frames_per_second as u64);
        let handle = thread::Builder::new()
            .name("concentrator-ticker".to_string())
            .spawn(move || {
                while shared.running.load(Ordering::SeqCst) {
                    shared.publish_ready_frames();
                    thread::sleep(period);
                }
                debug!("Concentrator ticker exiting");
            });

        match handle {
            Ok(handle) => {
                *ticker = Some(handle);
                info!(
                    "Concentrator started at {} frames per second",
                    self.shared.settings.frames_per_second
                );
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(ConcentratorError::Ticker(e))
            }
        }
    }

    /// Stops the ticker. Open frames stay queued. Safe to call more than once.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
            info!("Concentrator stopped");
        }
    }

    /// Multi-line summary of the settings and counters.
    pub fn status(&self) -> String {
        let settings = &self.shared.settings;
        let stats = self.statistics();
        let mut status = String::new();
        let mut line = |label: &str, value: String| {
            let _ = writeln!(status, "{:>32}: {}", label, value);
        };

        line("Frames per second", settings.frames_per_second.to_string());
        line("Lag time", format!("{} seconds", settings.lag_time));
        line("Lead time", format!("{} seconds", settings.lead_time));
        line("Time resolution", format!("{} ticks", settings.time_resolution));
        line(
            "Timestamp reasonability check",
            settings.perform_timestamp_reasonability_check.to_string(),
        );
        line(
            "Process by received timestamp",
            settings.process_by_received_timestamp.to_string(),
        );
        line("Ignore bad timestamps", settings.ignore_bad_timestamps.to_string());
        line("Allow sorts by arrival", settings.allow_sorts_by_arrival.to_string());
        line(
            "Use local clock as real time",
            settings.use_local_clock_as_real_time.to_string(),
        );
        line("Downsampling method", settings.downsampling_method.to_string());
        line(
            "Allow preemptive publishing",
            settings.allow_preemptive_publishing.to_string(),
        );
        line("Real time", format_ticks(self.real_time()));
        line("Open frames", self.open_frames().to_string());
        line("Received measurements", stats.received_measurements.to_string());
        line("Processed measurements", stats.processed_measurements.to_string());
        line("Discarded measurements", stats.discarded_measurements.to_string());
        line("Downsampled measurements", stats.downsampled_measurements.to_string());
        line(
            "Measurements sorted by arrival",
            stats.measurements_sorted_by_arrival.to_string(),
        );
        line("Missed sorts by timeout", stats.missed_sorts_by_timeout.to_string());
        line(
            "Last discarded latency",
            format!("{:.3} seconds", ticks_to_seconds(stats.last_discarded_latency)),
        );
        line("Published frames", stats.published_frames.to_string());
        line("Frames ahead of schedule", stats.frames_ahead_of_schedule.to_string());
        line("Published measurements", stats.published_measurements.to_string());
        line("Expected measurements", stats.expected_measurements.to_string());
        line(
            "Measurement loss",
            format!("{:.2}%", stats.measurement_loss_percent),
        );
        status
    }
}

impl Drop for Concentrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lead_tolerance(&self, a: Ticks, b: Ticks) -> bool {
        ticks_to_seconds(a - b).abs() <= self.settings.lead_time
    }

    fn real_time(&self) -> Ticks {
        if self.settings.use_local_clock_as_real_time {
            return self.clock.now();
        }
        if self.settings.perform_timestamp_reasonability_check {
            let now = self.clock.now();
            if !self.lead_tolerance(now, self.real_time.load(Ordering::SeqCst)) {
                self.real_time.store(now, Ordering::SeqCst);
            }
        }
        self.real_time.load(Ordering::SeqCst)
    }

    fn advance_real_time(&self, timestamp: Ticks) {
        if self.settings.use_local_clock_as_real_time
            || timestamp <= self.real_time.load(Ordering::SeqCst)
        {
            return;
        }
        if !self.settings.perform_timestamp_reasonability_check {
            self.real_time.store(timestamp, Ordering::SeqCst);
            return;
        }
        let now = self.clock.now();
        if self.lead_tolerance(timestamp, now) {
            self.real_time.store(timestamp, Ordering::SeqCst);
        } else if !self.lead_tolerance(now, self.real_time.load(Ordering::SeqCst)) {
            self.real_time.store(now, Ordering::SeqCst);
        }
    }

    fn discard(&self, measurement: &Measurement, reason: &str) {
        trace!("Discarding {} at {}: {}", measurement.key, measurement.timestamp, reason);
        self.counters.record_discard(measurement, self.real_time());
    }

    fn sort(&self, measurement: &Measurement) {
        Counters::add(&self.counters.received, 1);
        let settings = &self.settings;

        let timestamp = if !settings.ignore_bad_timestamps
            && measurement.state_flags.contains(StateFlags::BAD_TIME)
        {
            if !settings.allow_sorts_by_arrival {
                return self.discard(measurement, "bad timestamp");
            }
            Counters::add(&self.counters.sorted_by_arrival, 1);
            self.real_time()
        } else {
            measurement.timestamp
        };

        if !settings.process_by_received_timestamp {
            let distance = ticks_to_seconds(self.real_time() - timestamp);
            if distance > settings.lag_time {
                return self.discard(measurement, "older than lag time");
            }
            if settings.perform_timestamp_reasonability_check && distance < -settings.lead_time {
                return self.discard(measurement, "newer than lead time");
            }
        }

        let Some(target) = self.signals.get(&measurement.key).copied() else {
            return self.discard(measurement, "no signal mapping");
        };
        let Some(bucket) = self
            .queue
            .get_frame(timestamp, self.clock.now(), |slot| self.config.empty_frame(slot))
        else {
            return self.discard(measurement, "frame already published");
        };

        match bucket.assign(measurement, timestamp, target, settings.downsampling_method) {
            SortOutcome::Assigned => Counters::add(&self.counters.processed, 1),
            SortOutcome::Downsampled { applied } => {
                Counters::add(&self.counters.downsampled, 1);
                if applied {
                    Counters::add(&self.counters.processed, 1);
                }
            }
            SortOutcome::AlreadyPublished => {
                Counters::add(&self.counters.missed_sorts_by_timeout, 1);
                return self.discard(measurement, "frame published while sorting");
            }
            SortOutcome::Rejected => return self.discard(measurement, "no such field"),
        }

        self.advance_real_time(timestamp);
    }

    fn publish_ready_frames(&self) -> usize {
        let _guard = self.publish_lock.lock();
        let lag_ticks = self.settings.lag_ticks();
        let expected = self.signals.len();
        let mut published = 0;

        while let Some(bucket) = self.queue.head() {
            let reference = if self.settings.process_by_received_timestamp {
                bucket.created
            } else {
                bucket.timestamp
            };

            if reference + lag_ticks > self.real_time() {
                if !self.settings.allow_preemptive_publishing
                    || expected == 0
                    || bucket.sorted_measurements() < expected
                {
                    break;
                }
                Counters::add(&self.counters.frames_ahead_of_schedule, 1);
            }

            if !self.queue.claim(bucket.timestamp) {
                continue;
            }
            let sorted = bucket.sorted_measurements();
            let frame = bucket.publish();

            Counters::add(&self.counters.published_frames, 1);
            Counters::add(&self.counters.published_measurements, sorted as u64);
            published += 1;

            if self.output.send(frame).is_err() {
                trace!("Frame receiver dropped; frame at {} not delivered", bucket.timestamp);
            }
        }

        published
    }
}
