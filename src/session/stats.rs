use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

/// Bytes received since the last sample, turned into a rate on demand.
#[derive(Debug)]
pub struct ThroughputMeter {
    bytes: AtomicU64,
    last_sample: Mutex<Instant>,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        ThroughputMeter {
            bytes: AtomicU64::new(0),
            last_sample: Mutex::new(Instant::now()),
        }
    }
}

impl ThroughputMeter {
    pub fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes per second since the previous sample. Resets the counter and
    /// the sample time.
    pub fn sample(&self) -> f64 {
        let mut last = self.last_sample.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_secs_f64();
        *last = now;
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        }
    }
}
