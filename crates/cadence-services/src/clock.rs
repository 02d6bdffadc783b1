//! Clock sources: monotonic time in sample frames

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Current time in sample frames since the clock started
    fn now(&self) -> u64;

    fn sample_rate(&self) -> u32;

    fn samples_from_millis(&self, millis: u64) -> u64 {
        self.sample_rate() as u64 * millis / 1000
    }
}

/// Wall clock backed by `Instant`
pub struct SystemClock {
    origin: Instant,
    sample_rate: u32,
}

impl SystemClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            origin: Instant::now(),
            sample_rate: sample_rate.max(1),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        (elapsed.as_secs_f64() * self.sample_rate as f64) as u64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Clock that only moves when told to (tests, offline rendering)
pub struct ManualClock {
    position: AtomicU64,
    sample_rate: u32,
}

impl ManualClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            position: AtomicU64::new(0),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn advance(&self, samples: u64) -> u64 {
        self.position.fetch_add(samples, Ordering::SeqCst) + samples
    }

    pub fn advance_millis(&self, millis: u64) -> u64 {
        self.advance(self.samples_from_millis(millis))
    }

    /// Jump forward; never moves backwards
    pub fn set(&self, samples: u64) {
        self.position.fetch_max(samples, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
