use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Default minimum delay between two progress reports.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Time window used for the speed estimate.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Maximum retained speed samples.
const MAX_SAMPLES: usize = 100;

/// Snapshot of an in-flight transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    /// Average speed over the recent window (0.0 until two samples exist).
    pub bytes_per_second: f64,
}

impl TransferProgress {
    /// Completed fraction in `[0.0, 1.0]`. An empty transfer is complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.transferred as f64 / self.total as f64
    }

    /// Estimated time remaining, `None` while the speed is unknown.
    pub fn eta(&self) -> Option<Duration> {
        if self.bytes_per_second <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.transferred);
        Some(Duration::from_secs_f64(remaining as f64 / self.bytes_per_second))
    }
}

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Records chunk arrivals and decides when a progress report is due.
///
/// Reports are throttled to one per interval; the final report
/// (transferred == total) is always produced.
pub struct ProgressMeter {
    interval: Duration,
    last_report: Option<Instant>,
    samples: VecDeque<SpeedSample>,
}

impl ProgressMeter {
    /// Creates a meter. `None` uses the default 250 ms interval.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            last_report: None,
            samples: VecDeque::new(),
        }
    }

    /// Records `bytes` just received and returns a report if one is due.
    pub fn record(&mut self, bytes: u64, transferred: u64, total: u64) -> Option<TransferProgress> {
        let now = Instant::now();
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });
        while self
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.timestamp) > SPEED_WINDOW)
        {
            self.samples.pop_front();
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }

        let due = match self.last_report {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if !due && transferred < total {
            return None;
        }

        self.last_report = Some(now);
        Some(TransferProgress {
            transferred,
            total,
            bytes_per_second: self.bytes_per_second(),
        })
    }

    /// Average speed in bytes/second within the window.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes predate it.
        let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.last_report = None;
        self.samples.clear();
    }
}
