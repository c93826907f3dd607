use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Aggregate progress of everything the queue still holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    /// Bytes sent by in-flight transfers.
    pub loaded: u64,
    /// Expected bytes of in-flight and queued transfers.
    pub total: u64,
    /// Transfers currently dispatched.
    pub in_flight: usize,
    /// Transfers waiting for admission.
    pub queued: usize,
    /// Recent throughput over the speed window.
    pub bytes_per_second: f64,
    /// Time to send the remaining bytes at that rate, once known.
    pub eta: Option<Duration>,
}

/// Sliding-window throughput estimate fed by progress deltas.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Records `bytes` sent now.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    fn add_sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));

        if let Some(cutoff) = at.checked_sub(self.window) {
            while self.samples.front().is_some_and(|(t, _)| *t < cutoff) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average bytes/second across the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(*first);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to send `remaining` bytes, `None` while speed is unknown.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
