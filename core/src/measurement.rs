//! # Measurements and Time Base
//!
//! Timestamped measurement values as they arrive from devices, plus the 100 ns tick
//! time base and injectable clocks shared by the concentrator, parser and publisher.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// 100-nanosecond intervals since 1970-01-01 UTC.
pub type Ticks = i64;

pub const TICKS_PER_SECOND: Ticks = 10_000_000;
pub const TICKS_PER_MILLISECOND: Ticks = 10_000;

pub fn ticks_from_seconds(seconds: f64) -> Ticks {
    (seconds * TICKS_PER_SECOND as f64).round() as Ticks
}

pub fn ticks_to_seconds(ticks: Ticks) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

pub fn ticks_from_datetime(time: &DateTime<Utc>) -> Ticks {
    time.timestamp() * TICKS_PER_SECOND + (time.timestamp_subsec_nanos() / 100) as Ticks
}

pub fn ticks_to_datetime(ticks: Ticks) -> DateTime<Utc> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_default()
}

/// Formats ticks as `YYYY-MM-DD HH:MM:SS.fff`.
pub fn format_ticks(ticks: Ticks) -> String {
    ticks_to_datetime(ticks)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

pub fn utc_now_ticks() -> Ticks {
    ticks_from_datetime(&Utc::now())
}

/// Source of the local "now" used for lag/lead checks and configuration windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ticks;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ticks {
        utc_now_ticks()
    }
}

/// A clock that only moves when told to. Used to drive deterministic scenarios.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Ticks) -> Self {
        ManualClock {
            ticks: AtomicI64::new(start),
        }
    }

    pub fn set(&self, ticks: Ticks) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: Ticks) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Identifies a measured point: the source (device acronym) and a point index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub source: String,
    pub point_id: u32,
}

impl MeasurementKey {
    pub fn new(source: impl Into<String>, point_id: u32) -> Self {
        MeasurementKey {
            source: source.into(),
            point_id,
        }
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.point_id)
    }
}

/// Quality flags carried with every measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const NORMAL: StateFlags = StateFlags(0);
    pub const BAD_DATA: StateFlags = StateFlags(0x0001);
    pub const SUSPECT_DATA: StateFlags = StateFlags(0x0002);
    pub const BAD_TIME: StateFlags = StateFlags(0x0004);
    pub const SUSPECT_TIME: StateFlags = StateFlags(0x0008);
    pub const DISCARDED_VALUE: StateFlags = StateFlags(0x0010);
    pub const CALCULATED_VALUE: StateFlags = StateFlags(0x0020);

    pub fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: StateFlags) {
        self.0 |= other.0;
    }

    /// Rough quality rank used by best-quality downsampling: lower is better.
    pub fn quality_rank(self) -> u8 {
        let mut rank = 0;
        if self.contains(StateFlags::BAD_DATA) {
            rank += 4;
        }
        if self.contains(StateFlags::BAD_TIME) {
            rank += 2;
        }
        if self.contains(StateFlags::SUSPECT_DATA) || self.contains(StateFlags::SUSPECT_TIME) {
            rank += 1;
        }
        rank
    }
}

impl BitOr for StateFlags {
    type Output = StateFlags;

    fn bitor(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 | rhs.0)
    }
}

/// A single timestamped value from a device. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: Uuid,
    pub key: MeasurementKey,
    pub timestamp: Ticks,
    pub value: f64,
    pub state_flags: StateFlags,
}

impl Measurement {
    pub fn new(key: MeasurementKey, timestamp: Ticks, value: f64) -> Self {
        Measurement {
            id: Uuid::new_v4(),
            key,
            timestamp,
            value,
            state_flags: StateFlags::NORMAL,
        }
    }

    pub fn with_flags(mut self, flags: StateFlags) -> Self {
        self.state_flags = flags;
        self
    }

    /// Copy of this measurement re-stamped at `timestamp`, keeping its id.
    pub fn restamped(&self, timestamp: Ticks) -> Self {
        Measurement {
            timestamp,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_datetime_roundtrip() {
        let ticks = 1_672_531_200 * TICKS_PER_SECOND + 6_543_210;
        let time = ticks_to_datetime(ticks);
        assert_eq!(ticks_from_datetime(&time), ticks);
        assert_eq!(format_ticks(ticks), "2023-01-01 00:00:00.654");
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(TICKS_PER_SECOND);
        assert_eq!(clock.now(), 100 + TICKS_PER_SECOND);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn test_state_flags() {
        let mut flags = StateFlags::NORMAL;
        assert!(!flags.contains(StateFlags::BAD_TIME));
        flags.insert(StateFlags::BAD_TIME);
        assert!(flags.contains(StateFlags::BAD_TIME));
        assert!((flags | StateFlags::BAD_DATA).quality_rank() > flags.quality_rank());
    }
}
