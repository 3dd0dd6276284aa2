//! Progress and speed observers
//!
//! Periodic tasks that sample the slice manager's aggregates and forward
//! them to the caller's callbacks. Observers hold their own reference to
//! the manager and are aborted strictly before the manager is torn down.

use crate::manager::SliceManager;
use crate::types::{ProgressCallback, ProgressInfo, SpeedCallback};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Cadence of progress samples.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Cadence of speed samples.
const SPEED_INTERVAL: Duration = Duration::from_secs(1);

/// Emits `(total, downloaded)` to the caller at a fixed cadence.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(manager: Arc<SliceManager>, callback: ProgressCallback) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                callback(ProgressInfo {
                    total: manager.origin_file_size(),
                    downloaded: manager.total_downloaded(),
                });
            }
        });
        Self { handle }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Emits bytes/second to the caller, computed from deltas between samples.
pub struct SpeedReporter {
    handle: JoinHandle<()>,
}

impl SpeedReporter {
    pub fn spawn(manager: Arc<SliceManager>, callback: SpeedCallback) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SPEED_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last = manager.total_downloaded();
            let mut last_at = std::time::Instant::now();
            // First tick fires immediately; skip it so the first delta
            // covers a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now_bytes = manager.total_downloaded();
                let now = std::time::Instant::now();
                let elapsed = now.duration_since(last_at).as_secs_f64();
                let speed = if elapsed > 0.0 {
                    ((now_bytes.saturating_sub(last)) as f64 / elapsed) as u64
                } else {
                    0
                };
                callback(speed);
                last = now_bytes;
                last_at = now;
            }
        });
        Self { handle }
    }
}

impl Drop for SpeedReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_progress_reporter_samples() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 1,
            ..Default::default()
        };
        let manager = Arc::new(SliceManager::new(
            Arc::new(cfg),
            "http://example.com/f".into(),
            dir.path().join("f"),
            Some(100),
            String::new(),
        ));
        manager.make_slices(true).await.unwrap();
        manager.write_slice_data(0, &[0u8; 40]).await.unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        let reporter = ProgressReporter::spawn(
            Arc::clone(&manager),
            Arc::new(move |p: ProgressInfo| {
                seen_cb.store(p.downloaded, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(reporter);
        assert_eq!(seen.load(Ordering::SeqCst), 40);
    }
}
