use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond clock with a wall-clock anchor.
///
/// `now_ns` drives deadlines, entry timestamps, and processing-time
/// measurements; it never goes backwards within a broker run. `wall_seconds`
/// is the human-facing fallback stamped on trace events.
///
/// ```
/// use crossbar_broker::Clock;
///
/// let clock = Clock::new();
/// let a = clock.now_ns();
/// let b = clock.now_ns();
/// assert!(b >= a);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
    start_wall_seconds: f64,
}

impl Clock {
    pub fn new() -> Self {
        // If the wall clock predates the epoch we anchor at zero rather
        // than fail; trace timestamps are diagnostic only.
        let start_wall_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            start: Instant::now(),
            start_wall_seconds,
        }
    }

    /// Monotonic nanoseconds since an arbitrary per-process origin.
    pub fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Wall-clock seconds since the Unix epoch, advanced monotonically
    /// from the anchor captured at construction.
    pub fn wall_seconds(&self) -> f64 {
        self.start_wall_seconds + self.start.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
