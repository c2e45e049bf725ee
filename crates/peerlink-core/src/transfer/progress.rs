//! Transfer progress snapshots

use std::time::Duration;

/// Progress of one transfer at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// Transfer session id
    pub session_id: u32,

    /// Payload octets moved so far
    pub bytes_done: u64,

    /// Total payload octets (0 while unknown)
    pub bytes_total: u64,

    /// Time since the data pump started
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Snapshot with nothing transferred yet
    #[must_use]
    pub fn new(session_id: u32, bytes_total: u64) -> Self {
        Self {
            session_id,
            bytes_done: 0,
            bytes_total,
            elapsed: Duration::ZERO,
        }
    }

    /// Percentage complete (0.0 to 100.0)
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64 * 100.0).min(100.0)
    }

    /// Average throughput in bytes per second
    #[must_use]
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_done as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time remaining at the average throughput
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let speed = self.speed();
        if speed <= 0.0 || self.bytes_done >= self.bytes_total {
            return None;
        }
        Some(Duration::from_secs_f64(
            (self.bytes_total - self.bytes_done) as f64 / speed,
        ))
    }

    /// Whether every octet has been moved
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_total > 0 && self.bytes_done >= self.bytes_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_and_eta() {
        let mut progress = TransferProgress::new(60_000, 1000);
        assert_eq!(progress.percent(), 0.0);
        assert!(progress.eta().is_none());

        progress.bytes_done = 500;
        progress.elapsed = Duration::from_secs(5);
        assert_eq!(progress.percent(), 50.0);
        assert_eq!(progress.speed(), 100.0);
        assert_eq!(progress.eta().map(|d| d.as_secs()), Some(5));
        assert!(!progress.is_complete());

        progress.bytes_done = 1000;
        assert!(progress.is_complete());
        assert!(progress.eta().is_none());
    }

    #[test]
    fn test_unknown_total() {
        let progress = TransferProgress::new(1, 0);
        assert_eq!(progress.percent(), 0.0);
        assert!(!progress.is_complete());
    }
}
