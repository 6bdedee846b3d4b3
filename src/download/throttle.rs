//! Bandwidth pacing for the download stream.
//!
//! Throttling is enforced per chunk: after writing a chunk, the worker
//! sleeps for whatever remains of the chunk's target duration
//! (`chunk_len / limit`), so effective throughput never exceeds the
//! configured limit.

use std::time::Duration;

/// Per-transfer bandwidth cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    limit_bytes_per_sec: u64,
}

impl Throttle {
    /// Creates a cap of `limit_bytes_per_sec`; 0 disables throttling.
    #[must_use]
    pub fn new(limit_bytes_per_sec: u64) -> Self {
        Self { limit_bytes_per_sec }
    }

    /// A throttle that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Whether this throttle ever delays.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.limit_bytes_per_sec == 0
    }

    /// Time still to sleep after a chunk of `chunk_len` bytes took
    /// `elapsed` to arrive and be written. `None` when no delay is needed.
    #[must_use]
    pub fn required_delay(&self, chunk_len: usize, elapsed: Duration) -> Option<Duration> {
        if self.limit_bytes_per_sec == 0 || chunk_len == 0 {
            return None;
        }
        let target = Duration::from_secs_f64(chunk_len as f64 / self.limit_bytes_per_sec as f64);
        target.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
