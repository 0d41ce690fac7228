//! File-Ready Gate (spec.md §4.5): waits until a ripped file's size is
//! stable and the handle is releasable before downstream consumption.
//!
//! Grounded on the poll-and-retry loop used for HLS segment availability
//! in `ferrex-server/src/transcoding/handlers.rs`: a fixed interval, a
//! small consecutive-success counter, and a size/time-derived timeout
//! rather than a fixed one.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

const MIN_SIZE_RATIO: f64 = 0.85;

/// Polls a file's size until it looks finished, or gives up.
pub struct FileReadyGate {
    poll_interval: Duration,
    stability_checks: u32,
    default_timeout: Duration,
}

impl FileReadyGate {
    pub fn new(poll_interval: Duration, stability_checks: u32, default_timeout: Duration) -> Self {
        Self {
            poll_interval,
            stability_checks: stability_checks.max(1),
            default_timeout,
        }
    }

    fn timeout_for(&self, expected_size_bytes: u64) -> Duration {
        let mib = expected_size_bytes as f64 / (1024.0 * 1024.0);
        let derived = Duration::from_secs_f64(mib * 2.0);
        self.default_timeout.max(derived)
    }

    /// Returns `Ok(true)` once the file is ready per §4.5's three
    /// conditions, `Ok(false)` on timeout. Never returns an error on its
    /// own — a permission-denied or not-yet-existing file just keeps the
    /// file "not ready" until the timeout, the same as an unstable size.
    pub async fn wait_ready(&self, path: &Path, expected_size_bytes: u64) -> bool {
        let timeout = self.timeout_for(expected_size_bytes);
        let deadline = Instant::now() + timeout;

        let mut last_size: Option<u64> = None;
        let mut stable_count = 0u32;

        loop {
            if Instant::now() >= deadline {
                debug!(path = %path.display(), "file-ready gate timed out");
                return false;
            }

            let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            let openable = tokio::fs::File::open(path).await.is_ok();

            if Some(size) == last_size {
                stable_count += 1;
            } else {
                stable_count = 1;
                last_size = Some(size);
            }

            let size_ratio = if expected_size_bytes == 0 {
                1.0
            } else {
                size as f64 / expected_size_bytes as f64
            };
            let percent = (size_ratio * 100.0).min(99.0);
            debug!(path = %path.display(), percent, stable_count, "waiting_for_file");

            if stable_count >= self.stability_checks && size_ratio >= MIN_SIZE_RATIO && openable {
                return true;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn ready_once_size_is_stable_and_above_threshold() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 1000]).unwrap();
        file.flush().unwrap();

        let gate = FileReadyGate::new(Duration::from_millis(5), 2, Duration::from_millis(200));
        let ready = gate.wait_ready(file.path(), 1000).await;
        assert!(ready);
    }

    #[tokio::test]
    async fn rejects_file_below_85_percent_threshold() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 840]).unwrap();
        file.flush().unwrap();

        // 840/1000 = 84%, stable but below the 85% threshold: never ready,
        // so this should time out rather than return true.
        let gate = FileReadyGate::new(Duration::from_millis(5), 2, Duration::from_millis(50));
        let ready = gate.wait_ready(file.path(), 1000).await;
        assert!(!ready);
    }

    #[tokio::test]
    async fn missing_file_times_out_instead_of_erroring() {
        let gate = FileReadyGate::new(Duration::from_millis(5), 2, Duration::from_millis(30));
        let ready = gate.wait_ready(Path::new("/nonexistent/path.mkv"), 1000).await;
        assert!(!ready);
    }
}
