//! Session timing.
//!
//! Every session is anchored to a monotonic epoch taken when it starts,
//! paired with the wall-clock time of that moment for reporting.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Monotonic clock anchored to the start of one capture session.
#[derive(Debug, Clone)]
pub struct SessionClock {
    epoch: Instant,
    started_at: DateTime<Utc>,
}

impl SessionClock {
    /// Anchor a clock to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock start time, RFC 3339.
    pub fn started_at(&self) -> String {
        self.started_at.to_rfc3339()
    }
}

/// Decides when buffered recorder data is due for delivery.
///
/// Offsets are measured from the start of recording; the first offset
/// offered is never due, so the first chunk covers a full interval.
#[derive(Debug)]
pub struct ChunkPacer {
    interval: Duration,
    last: Duration,
}

impl ChunkPacer {
    /// A zero interval is treated as one nanosecond.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_nanos(1)),
            last: Duration::ZERO,
        }
    }

    /// Whether a chunk is due at `offset`. Advances the pacer when it is.
    pub fn due(&mut self, offset: Duration) -> bool {
        if offset >= self.last + self.interval {
            self.last = offset;
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_reports_start_time() {
        let clock = SessionClock::start();
        assert!(clock.elapsed() < Duration::from_secs(1));
        assert!(DateTime::parse_from_rfc3339(&clock.started_at()).is_ok());
    }

    #[test]
    fn pacer_waits_a_full_interval() {
        let mut pacer = ChunkPacer::new(Duration::from_millis(500));
        assert!(!pacer.due(Duration::ZERO));
        assert!(!pacer.due(Duration::from_millis(499)));
        assert!(pacer.due(Duration::from_millis(500)));
        assert!(!pacer.due(Duration::from_millis(900)));
        assert!(pacer.due(Duration::from_millis(1_050)));
    }

    #[test]
    fn zero_interval_is_always_due() {
        let mut pacer = ChunkPacer::new(Duration::ZERO);
        assert_eq!(pacer.interval(), Duration::from_nanos(1));
        assert!(pacer.due(Duration::from_millis(1)));
    }
}
