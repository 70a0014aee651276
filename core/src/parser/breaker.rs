use std::time::{Duration, Instant};

/// Counts parsing exceptions inside a window that opens at the first exception.
#[derive(Debug)]
pub struct ExceptionWindow {
    allowed: u32,
    window: Duration,
    opened: Option<Instant>,
    count: u32,
}

impl ExceptionWindow {
    pub fn new(allowed: u32, window_seconds: f64) -> Self {
        ExceptionWindow {
            allowed,
            window: Duration::from_secs_f64(window_seconds.max(0.0)),
            opened: None,
            count: 0,
        }
    }

    /// Records one exception at `now`. Returns true when the threshold is exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        match self.opened {
            Some(opened) if now.duration_since(opened) <= self.window => self.count += 1,
            _ => {
                self.opened = Some(now);
                self.count = 1;
            }
        }
        self.count > self.allowed
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.opened = None;
        self.count = 0;
    }
}
