use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// Window over which the transfer rate is averaged.
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Upper bound on retained rate samples.
const MAX_SAMPLES: usize = 100;

/// Progress snapshot for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferProgress {
    pub transfer_id: Uuid,
    pub bytes_transferred: u64,
    /// From the declared content length or the caller's expected size.
    pub total_bytes: Option<u64>,
    pub bytes_per_second: f64,
}

impl FileTransferProgress {
    /// Completion percentage, when the total is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_transferred as f64 / total as f64 * 100.0),
            None => None,
        }
    }
}

/// Receives a snapshot after every chunk.
pub type ProgressCallback = Arc<dyn Fn(FileTransferProgress) + Send + Sync>;

struct Sample {
    bytes: u64,
    at: Instant,
}

/// Accumulates transferred bytes and derives the running rate from a
/// sliding window of samples.
pub(crate) struct ProgressMeter {
    transfer_id: Uuid,
    total_bytes: Option<u64>,
    bytes: u64,
    started: Instant,
    samples: VecDeque<Sample>,
}

impl ProgressMeter {
    pub(crate) fn new(transfer_id: Uuid, total_bytes: Option<u64>) -> Self {
        Self {
            transfer_id,
            total_bytes,
            bytes: 0,
            started: Instant::now(),
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Records `n` more bytes and returns the new snapshot.
    pub(crate) fn advance(&mut self, n: u64) -> FileTransferProgress {
        self.advance_at(n, Instant::now())
    }

    fn advance_at(&mut self, n: u64, now: Instant) -> FileTransferProgress {
        self.bytes = self.bytes.saturating_add(n);
        self.samples.push_back(Sample { bytes: n, at: now });

        let cutoff = now.checked_sub(RATE_WINDOW).unwrap_or(self.started);
        while self.samples.len() > MAX_SAMPLES
            || self.samples.front().is_some_and(|s| s.at < cutoff)
        {
            self.samples.pop_front();
        }

        FileTransferProgress {
            transfer_id: self.transfer_id,
            bytes_transferred: self.bytes,
            total_bytes: self.total_bytes,
            bytes_per_second: self.rate(now),
        }
    }

    /// Bytes per second over the window; falls back to the whole transfer
    /// while the window holds a single sample.
    fn rate(&self, now: Instant) -> f64 {
        let (bytes, since) = match (self.samples.front(), self.samples.len()) {
            (Some(first), n) if n >= 2 => {
                // The first sample's bytes arrived before its timestamp.
                let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
                (bytes, first.at)
            }
            _ => (self.bytes, self.started),
        };
        let elapsed = now.saturating_duration_since(since);
        if elapsed.is_zero() {
            return 0.0;
        }
        bytes as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_accumulate_monotonically() {
        let mut meter = ProgressMeter::new(Uuid::new_v4(), Some(100));
        let mut last = 0;
        for n in [10, 0, 25, 5] {
            let p = meter.advance(n);
            assert!(p.bytes_transferred >= last);
            last = p.bytes_transferred;
        }
        assert_eq!(meter.bytes(), 40);
    }

    #[test]
    fn rate_uses_window() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new(Uuid::new_v4(), None);
        meter.started = start;

        meter.advance_at(1000, start + Duration::from_secs(1));
        let p = meter.advance_at(2000, start + Duration::from_secs(2));
        assert!((p.bytes_per_second - 2000.0).abs() < 1e-6, "{}", p.bytes_per_second);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new(Uuid::new_v4(), None);
        meter.started = start;

        meter.advance_at(1_000_000, start + Duration::from_secs(1));
        meter.advance_at(10, start + Duration::from_secs(20));
        let p = meter.advance_at(10, start + Duration::from_secs(21));
        assert!((p.bytes_per_second - 10.0).abs() < 1e-6, "{}", p.bytes_per_second);
        assert_eq!(p.bytes_transferred, 1_000_020);
    }

    #[test]
    fn first_sample_uses_elapsed_since_start() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new(Uuid::new_v4(), None);
        meter.started = start;

        let p = meter.advance_at(500, start + Duration::from_secs(2));
        assert!((p.bytes_per_second - 250.0).abs() < 1e-6);
    }

    #[test]
    fn percent_handles_unknown_and_empty_totals() {
        let id = Uuid::new_v4();
        let p = FileTransferProgress {
            transfer_id: id,
            bytes_transferred: 25,
            total_bytes: Some(100),
            bytes_per_second: 0.0,
        };
        assert_eq!(p.percent(), Some(25.0));
        assert_eq!(FileTransferProgress { total_bytes: None, ..p.clone() }.percent(), None);
        assert_eq!(FileTransferProgress { total_bytes: Some(0), ..p }.percent(), Some(100.0));
    }
}
