//! Client-side timestamp generation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{Duration, Instant};
use tracing::warn;

pub trait TimestampGenerator: Send + Sync {
    /// Generates the next timestamp, in microseconds since the UNIX epoch.
    fn next_timestamp(&self) -> i64;
}

/// Reads the system clock without any monotonicity guarantee.
#[derive(Default)]
pub struct SimpleTimestampGenerator;

impl SimpleTimestampGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl TimestampGenerator for SimpleTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as i64
    }
}

/// Strictly monotonic timestamps within one generator instance.
///
/// If the system clock stalls or goes backwards, timestamps are artificially
/// incremented past the last generated value; skews larger than
/// `skew_warning_threshold` are reported, at most once per
/// `skew_warning_interval`.
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    last_warning: Mutex<Instant>,
    skew_warning_threshold: Duration,
    skew_warning_interval: Duration,
}

impl MonotonicTimestampGenerator {
    pub fn new() -> Self {
        MonotonicTimestampGenerator {
            last: AtomicI64::new(0),
            last_warning: Mutex::new(Instant::now()),
            skew_warning_threshold: Duration::from_secs(1),
            skew_warning_interval: Duration::from_secs(1),
        }
    }

    pub fn with_warning_times(mut self, threshold: Duration, interval: Duration) -> Self {
        self.skew_warning_threshold = threshold;
        self.skew_warning_interval = interval;
        self
    }

    fn compute_next(&self, last: i64) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => {
                let now = now.as_micros() as i64;
                if now > last {
                    return now;
                }
                if last - now > self.skew_warning_threshold.as_micros() as i64 {
                    self.maybe_warn(last - now);
                }
            }
            Err(_) => warn!("Clock skew detected: current time is before the UNIX epoch"),
        }
        last + 1
    }

    fn maybe_warn(&self, skew_micros: i64) {
        let mut last_warning = self.last_warning.lock().unwrap();
        let now = Instant::now();
        if now >= *last_warning + self.skew_warning_interval {
            *last_warning = now;
            drop(last_warning);
            warn!(
                "Clock skew detected: the clock is {} microseconds behind the last \
                 generated timestamp; timestamps are being artificially incremented \
                 to stay monotonic",
                skew_micros
            );
        }
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let next = self.compute_next(last);
            if self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_generator_is_strictly_increasing() {
        let generator = MonotonicTimestampGenerator::new();
        let mut prev = None;
        for _ in 0..1000 {
            let cur = generator.next_timestamp();
            if let Some(prev) = prev {
                assert!(cur > prev);
            }
            prev = Some(cur);
        }
    }

    #[test]
    fn monotonic_generator_has_no_duplicates_across_threads() {
        use std::collections::HashSet;
        use std::sync::Arc;

        const ITERATIONS: usize = 1000;
        const THREADS: usize = 8;

        let generator = Arc::new(MonotonicTimestampGenerator::new());
        let sets: Vec<HashSet<i64>> = std::thread::scope(|s| {
            (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let timestamps: Vec<i64> =
                            (0..ITERATIONS).map(|_| generator.next_timestamp()).collect();
                        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
                        timestamps.into_iter().collect()
                    })
                })
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        let all: HashSet<i64> = sets.iter().flatten().copied().collect();
        assert_eq!(all.len(), ITERATIONS * THREADS);
    }
}
