//! Progress math and formatting for in-flight transfers.

use std::time::Duration;

/// Guards speed and ETA divisions against zero.
const EPSILON: f64 = 1e-5;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time view of one transfer, emitted after every chunk.
///
/// Speed and ETA are averaged since the current measurement baseline. The
/// baseline resets on resume so figures stay accurate instead of being
/// smeared across the paused wall-clock gap.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Percentage complete, 0.0 to 100.0.
    pub percent: f64,
    /// Bytes present in the partial file so far.
    pub bytes_downloaded: u64,
    /// Expected total size in bytes.
    pub total_bytes: u64,
    /// Wall-clock time since the measurement baseline.
    pub elapsed: Duration,
    /// Average transfer speed since the baseline, bytes per second.
    pub bytes_per_sec: f64,
    /// Estimated time remaining at the current average speed.
    pub eta: Duration,
}

impl ProgressSnapshot {
    /// Computes a snapshot from raw counters.
    ///
    /// `baseline_bytes` is the partial-file size at the measurement
    /// baseline (transfer start or last resume); only bytes past it count
    /// toward the speed average.
    #[must_use]
    pub fn compute(
        baseline_bytes: u64,
        current_bytes: u64,
        total_bytes: u64,
        elapsed: Duration,
    ) -> Self {
        let transferred = current_bytes.saturating_sub(baseline_bytes);
        let bytes_per_sec = transferred as f64 / (elapsed.as_secs_f64() + EPSILON);
        let remaining = total_bytes.saturating_sub(current_bytes);
        let eta_secs = remaining as f64 / (bytes_per_sec + EPSILON);
        let percent = if total_bytes == 0 {
            100.0
        } else {
            (current_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        };

        Self {
            percent,
            bytes_downloaded: current_bytes,
            total_bytes,
            elapsed,
            bytes_per_sec,
            // saturating cast: an effectively-stalled transfer reports a
            // huge but finite ETA
            eta: Duration::from_secs(eta_secs as u64),
        }
    }

    /// Human-readable status line for the progress label callback.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "Progress: {:.2}% ({:.2}MB/{:.2}MB) | Time passed: {:.2}s | Speed: {:.2}MB/s | Time left: {}",
            self.percent,
            self.bytes_downloaded as f64 / BYTES_PER_MB,
            self.total_bytes as f64 / BYTES_PER_MB,
            self.elapsed.as_secs_f64(),
            self.bytes_per_sec / BYTES_PER_MB,
            format_duration(self.eta),
        )
    }
}

/// Formats a duration as `HH:MM:SS`, with a day prefix past 24 hours.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if days > 0 {
        format!("{days} days, {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_percent_and_speed() {
        let snapshot =
            ProgressSnapshot::compute(0, 500_000, 1_000_000, Duration::from_secs(5));
        assert!((snapshot.percent - 50.0).abs() < 0.01);
        assert!((snapshot.bytes_per_sec - 100_000.0).abs() < 100.0);
        // 500_000 bytes left at ~100_000 B/s
        assert_eq!(snapshot.eta.as_secs(), 4);
    }

    #[test]
    fn snapshot_counts_speed_from_baseline_only() {
        // Resumed at 800_000 of 1_000_000; 100_000 fresh bytes in 1s.
        let snapshot =
            ProgressSnapshot::compute(800_000, 900_000, 1_000_000, Duration::from_secs(1));
        assert!((snapshot.percent - 90.0).abs() < 0.01);
        assert!((snapshot.bytes_per_sec - 100_000.0).abs() < 100.0);
    }

    #[test]
    fn snapshot_survives_zero_elapsed_and_zero_total() {
        let snapshot = ProgressSnapshot::compute(0, 0, 1_000, Duration::ZERO);
        assert_eq!(snapshot.percent, 0.0);
        assert!(snapshot.bytes_per_sec.is_finite());
        assert!(snapshot.eta.as_secs() > 0);

        let done = ProgressSnapshot::compute(0, 0, 0, Duration::ZERO);
        assert_eq!(done.percent, 100.0);
    }

    #[test]
    fn percent_never_exceeds_hundred() {
        // Servers occasionally deliver a few bytes more than advertised.
        let snapshot = ProgressSnapshot::compute(0, 1_100, 1_000, Duration::from_secs(1));
        assert_eq!(snapshot.percent, 100.0);
    }

    #[test]
    fn format_duration_plain() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_duration(Duration::from_secs(3_661)), "01:01:01");
    }

    #[test]
    fn format_duration_with_days() {
        assert_eq!(
            format_duration(Duration::from_secs(2 * 86_400 + 3_600 + 60 + 1)),
            "2 days, 01:01:01"
        );
    }

    #[test]
    fn label_contains_all_fields() {
        let snapshot = ProgressSnapshot::compute(
            0,
            50 * 1024 * 1024,
            100 * 1024 * 1024,
            Duration::from_secs(10),
        );
        let label = snapshot.label();
        assert!(label.contains("50.00%"), "label: {label}");
        assert!(label.contains("50.00MB/100.00MB"), "label: {label}");
        assert!(label.contains("Time left:"), "label: {label}");
    }
}
