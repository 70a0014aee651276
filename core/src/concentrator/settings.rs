use crate::measurement::{Ticks, TICKS_PER_SECOND};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConcentratorError {
    #[error("invalid concentrator settings: {0}")]
    InvalidSettings(String),
    #[error("failed to start the publication ticker: {0}")]
    Ticker(#[from] std::io::Error),
}

/// How a frame keeps one value per signal when a source reports faster than the
/// output rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownsamplingMethod {
    /// The newest arrival wins.
    #[default]
    LastReceived,
    /// The value whose timestamp is closest to the frame timestamp wins.
    Closest,
    /// The value with the best quality flags wins; ties go to the closest.
    BestQuality,
}

impl fmt::Display for DownsamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownsamplingMethod::LastReceived => write!(f, "LastReceived"),
            DownsamplingMethod::Closest => write!(f, "Closest"),
            DownsamplingMethod::BestQuality => write!(f, "BestQuality"),
        }
    }
}

/// Concentrator timing and sorting settings. Lag and lead times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcentratorSettings {
    pub frames_per_second: u32,
    pub lag_time: f64,
    pub lead_time: f64,
    /// Timestamps are truncated to this many ticks before bucketing. Zero keeps full
    /// resolution.
    pub time_resolution: Ticks,
    pub perform_timestamp_reasonability_check: bool,
    pub process_by_received_timestamp: bool,
    pub ignore_bad_timestamps: bool,
    pub allow_sorts_by_arrival: bool,
    pub use_local_clock_as_real_time: bool,
    pub downsampling_method: DownsamplingMethod,
    pub allow_preemptive_publishing: bool,
}

impl Default for ConcentratorSettings {
    fn default() -> Self {
        ConcentratorSettings {
            frames_per_second: 30,
            lag_time: 3.0,
            lead_time: 1.0,
            time_resolution: 0,
            perform_timestamp_reasonability_check: true,
            process_by_received_timestamp: false,
            ignore_bad_timestamps: false,
            allow_sorts_by_arrival: true,
            use_local_clock_as_real_time: false,
            downsampling_method: DownsamplingMethod::LastReceived,
            allow_preemptive_publishing: true,
        }
    }
}

impl ConcentratorSettings {
    pub fn new(frames_per_second: u32, lag_time: f64, lead_time: f64) -> Self {
        ConcentratorSettings {
            frames_per_second,
            lag_time,
            lead_time,
            ..ConcentratorSettings::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConcentratorError> {
        if !(1..=1000).contains(&self.frames_per_second) {
            return Err(ConcentratorError::InvalidSettings(format!(
                "framesPerSecond must be between 1 and 1000, got {}",
                self.frames_per_second
            )));
        }
        if !(self.lag_time > 0.0) {
            return Err(ConcentratorError::InvalidSettings(format!(
                "lagTime must be greater than zero, got {}",
                self.lag_time
            )));
        }
        if !(self.lead_time > 0.0) {
            return Err(ConcentratorError::InvalidSettings(format!(
                "leadTime must be greater than zero, got {}",
                self.lead_time
            )));
        }
        if self.time_resolution < 0 || self.time_resolution > TICKS_PER_SECOND {
            return Err(ConcentratorError::InvalidSettings(format!(
                "timeResolution must be between 0 and {} ticks, got {}",
                TICKS_PER_SECOND, self.time_resolution
            )));
        }
        Ok(())
    }

    /// Applies the flags implied by received-timestamp processing.
    pub fn normalized(mut self) -> Self {
        if self.process_by_received_timestamp {
            self.use_local_clock_as_real_time = true;
            self.allow_sorts_by_arrival = false;
        }
        self
    }

    pub fn ticks_per_frame(&self) -> f64 {
        TICKS_PER_SECOND as f64 / self.frames_per_second as f64
    }

    pub fn lag_ticks(&self) -> Ticks {
        crate::measurement::ticks_from_seconds(self.lag_time)
    }
}
