//! Slice manager
//!
//! Owns the slice vector, the temp data file and the sidecar index. All
//! slice mutation funnels through here from the coordinator task; observers
//! only read the aggregate counters.

use crate::checksum;
use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult, Result};
use crate::http::TransferRequest;
use crate::index::{IndexFile, SliceRecord};
use crate::slice::{Slice, SliceStatus};
use crate::types::{HashVerifyPolicy, UncompletedSliceSavePolicy};
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Suffix appended to the target path for the temp data file.
pub const TMP_FILE_SUFFIX: &str = ".part";

/// Read-only view of one slice for the coordinator and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSnapshot {
    pub index: usize,
    pub begin: u64,
    pub end: Option<u64>,
    pub downloaded: u64,
    pub received: u64,
    pub status: SliceStatus,
    pub failed_times: u32,
}

/// Owner of all per-run durable state.
pub struct SliceManager {
    cfg: Arc<DownloadConfig>,
    /// Final (post-redirect) URL slices are fetched from.
    url: String,
    target_path: PathBuf,
    tmp_path: PathBuf,
    index_path: PathBuf,
    origin_file_size: Option<u64>,
    content_md5: String,
    slices: Mutex<Vec<Slice>>,
    file: tokio::sync::Mutex<Option<File>>,
    /// Bytes received across all slices, buffered plus flushed.
    total_downloaded: AtomicU64,
}

impl SliceManager {
    pub fn new(
        cfg: Arc<DownloadConfig>,
        url: String,
        target_path: PathBuf,
        origin_file_size: Option<u64>,
        content_md5: String,
    ) -> Self {
        let tmp_path = Self::tmp_path_for(&target_path);
        let index_path = IndexFile::path_for(&tmp_path);
        Self {
            cfg,
            url,
            target_path,
            tmp_path,
            index_path,
            origin_file_size,
            content_md5,
            slices: Mutex::new(Vec::new()),
            file: tokio::sync::Mutex::new(None),
            total_downloaded: AtomicU64::new(0),
        }
    }

    /// Temp data file path for a target path.
    pub fn tmp_path_for(target: &Path) -> PathBuf {
        let mut os = target.as_os_str().to_owned();
        os.push(TMP_FILE_SUFFIX);
        PathBuf::from(os)
    }

    pub fn origin_file_size(&self) -> Option<u64> {
        self.origin_file_size
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    // ---- layout -----------------------------------------------------------

    /// Try to restore the slice layout from the sidecar index.
    ///
    /// The index is accepted only when its URL, file size and content hash
    /// match the fresh probe and the temp file is still usable. Rejection
    /// reasons map onto distinct result codes; the caller discards the index
    /// and falls back to `make_slices`.
    pub async fn load_exist_slices(&self) -> Result<()> {
        let index = IndexFile::load(&self.index_path).await?;

        if index.url != self.url {
            return Err(DownloadError::IndexRejected {
                code: DownloadResult::UrlDifferent,
                reason: format!("index url {} does not match {}", index.url, self.url),
            });
        }
        if index.file_size != self.origin_file_size {
            return Err(DownloadError::IndexRejected {
                code: DownloadResult::TmpFileExpired,
                reason: "remote file size changed since the index was written".into(),
            });
        }
        if !index.content_hash.is_empty()
            && !self.content_md5.is_empty()
            && index.content_hash != self.content_md5
        {
            return Err(DownloadError::IndexRejected {
                code: DownloadResult::TmpFileExpired,
                reason: "remote content hash changed since the index was written".into(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.tmp_path)
            .await
            .map_err(|e| {
                DownloadError::storage(
                    DownloadResult::OpenTmpFileFailed,
                    &self.tmp_path,
                    format!("open temp file failed: {e}"),
                )
            })?;
        let meta = file.metadata().await.map_err(|e| {
            DownloadError::storage(DownloadResult::TmpFileCannotRw, &self.tmp_path, e.to_string())
        })?;
        if let Some(size) = self.origin_file_size {
            if meta.len() > size {
                return Err(DownloadError::storage(
                    DownloadResult::TmpFileSizeError,
                    &self.tmp_path,
                    format!(
                        "temp file is {} bytes, larger than the resource ({size})",
                        meta.len()
                    ),
                ));
            }
        }

        let slices: Vec<Slice> = index.slices.iter().map(Slice::from_record).collect();
        let total: u64 = slices.iter().map(|s| s.downloaded()).sum();

        *self.file.lock().await = Some(file);
        *self.slices.lock() = slices;
        self.total_downloaded.store(total, Ordering::Relaxed);
        tracing::debug!(total, "restored slice layout from index");
        Ok(())
    }

    /// Build a fresh slice layout and temp file.
    pub async fn make_slices(&self, accept_ranges: bool) -> Result<()> {
        let thread_count = self.cfg.resolved_thread_count() as u64;
        let slices = match self.origin_file_size {
            None => vec![Slice::new(0, 0, None)],
            Some(size) if !accept_ranges || thread_count <= 1 => {
                vec![Slice::new(0, 0, Some(size - 1))]
            }
            Some(size) => partition(size, thread_count),
        };

        let file = File::create(&self.tmp_path).await.map_err(|e| {
            DownloadError::storage(
                DownloadResult::CreateTmpFileFailed,
                &self.tmp_path,
                format!("create temp file failed: {e}"),
            )
        })?;
        if let Some(size) = self.origin_file_size {
            file.set_len(size).await.map_err(|e| {
                DownloadError::storage(
                    DownloadResult::InitTmpFileFailed,
                    &self.tmp_path,
                    format!("pre-allocate failed: {e}"),
                )
            })?;
        }

        *self.file.lock().await = Some(file);
        *self.slices.lock() = slices;
        self.total_downloaded.store(0, Ordering::Relaxed);
        // A stale sidecar no longer describes this layout.
        IndexFile::remove(&self.index_path).await;
        Ok(())
    }

    // ---- selection & status ----------------------------------------------

    pub fn slice_count(&self) -> usize {
        self.slices.lock().len()
    }

    pub fn first_with_status(&self, status: SliceStatus) -> Option<usize> {
        self.slices
            .lock()
            .iter()
            .find(|s| s.status() == status)
            .map(|s| s.index())
    }

    /// First failed slice that still has retry budget.
    pub fn first_retryable_failed(&self) -> Option<usize> {
        let max = self.cfg.slice_max_failed_times;
        self.slices
            .lock()
            .iter()
            .find(|s| s.status() == SliceStatus::Failed && s.can_retry(max))
            .map(|s| s.index())
    }

    pub fn set_status(&self, index: usize, status: SliceStatus) {
        if let Some(slice) = self.slices.lock().get_mut(index) {
            slice.set_status(status);
        }
    }

    /// Mark a slice failed and burn one retry.
    pub fn note_failed(&self, index: usize) {
        if let Some(slice) = self.slices.lock().get_mut(index) {
            slice.set_status(SliceStatus::Failed);
            slice.increase_failed_times();
        }
    }

    pub fn snapshot(&self, index: usize) -> Option<SliceSnapshot> {
        self.slices.lock().get(index).map(snapshot_of)
    }

    pub fn snapshots(&self) -> Vec<SliceSnapshot> {
        self.slices.lock().iter().map(snapshot_of).collect()
    }

    /// Number of slices that are not yet completed.
    pub fn unfinished_count(&self) -> u32 {
        self.slices
            .lock()
            .iter()
            .filter(|s| s.status() != SliceStatus::Completed)
            .count() as u32
    }

    pub fn all_slices_completed(&self) -> bool {
        self.slices
            .lock()
            .iter()
            .all(|s| s.status() == SliceStatus::Completed)
    }

    /// Whether some slice is failed with no retry budget left.
    pub fn has_permanently_failed(&self) -> bool {
        let max = self.cfg.slice_max_failed_times;
        self.slices
            .lock()
            .iter()
            .any(|s| s.status() == SliceStatus::Failed && !s.can_retry(max))
    }

    /// Aggregate completeness judged purely by byte counts.
    pub fn check_all_completed_by_file_size(&self) -> bool {
        match self.origin_file_size {
            Some(size) => self.total_downloaded() == size,
            None => false,
        }
    }

    /// Stamp the RAM budget and transition to `Fetched`, returning the
    /// request the transfer pool needs for this slice.
    pub fn prepare_start(
        &self,
        index: usize,
        buffer_capacity: usize,
        max_speed: Option<u64>,
    ) -> Option<TransferRequest> {
        let mut slices = self.slices.lock();
        let slice = slices.get_mut(index)?;
        slice.set_buffer_capacity(buffer_capacity);
        slice.set_status(SliceStatus::Fetched);
        Some(TransferRequest {
            slice: index,
            url: self.url.clone(),
            offset: slice.resume_offset(),
            end: slice.end(),
            max_speed,
        })
    }

    // ---- data path --------------------------------------------------------

    /// Stage incoming bytes for a slice, flushing to disk when the slice's
    /// RAM budget fills up. Bytes beyond the slice range are clamped.
    pub async fn write_slice_data(&self, index: usize, data: &[u8]) -> Result<()> {
        let pending = {
            let mut slices = self.slices.lock();
            let Some(slice) = slices.get_mut(index) else {
                return Ok(());
            };
            if slice.status() == SliceStatus::Fetched {
                slice.set_status(SliceStatus::Downloading);
            }
            let accepted = slice.accept(data);
            if accepted < data.len() {
                tracing::warn!(
                    slice = index,
                    dropped = data.len() - accepted,
                    "received bytes beyond the slice range"
                );
            }
            self.total_downloaded
                .fetch_add(accepted as u64, Ordering::Relaxed);
            if slice.needs_flush() {
                slice.take_buffer()
            } else {
                None
            }
        };
        if let Some((offset, buf)) = pending {
            self.write_at(offset, &buf).await?;
            if let Some(slice) = self.slices.lock().get_mut(index) {
                slice.commit_flush(buf.len() as u64);
            }
        }
        Ok(())
    }

    /// Drain one slice's RAM buffer to its region of the temp file.
    pub async fn flush_slice(&self, index: usize) -> Result<()> {
        let pending = self
            .slices
            .lock()
            .get_mut(index)
            .and_then(|s| s.take_buffer());
        if let Some((offset, buf)) = pending {
            self.write_at(offset, &buf).await?;
            if let Some(slice) = self.slices.lock().get_mut(index) {
                slice.commit_flush(buf.len() as u64);
            }
        }
        Ok(())
    }

    pub async fn flush_all_slices(&self) -> Result<()> {
        let count = self.slice_count();
        for index in 0..count {
            self.flush_slice(index).await?;
        }
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await.map_err(|e| {
                DownloadError::storage(
                    DownloadResult::TmpFileCannotRw,
                    &self.tmp_path,
                    e.to_string(),
                )
            })?;
        }
        Ok(())
    }

    /// Atomically rewrite the sidecar index from the current slice state.
    ///
    /// Callers flush slices first so the index never describes bytes that
    /// are not on disk.
    pub async fn flush_index_file(&self) -> Result<()> {
        let records: Vec<SliceRecord> = self.slices.lock().iter().map(|s| s.record()).collect();
        let index = IndexFile {
            url: self.url.clone(),
            file_size: self.origin_file_size,
            content_hash: self.content_md5.clone(),
            slices: records,
        };
        index.store(&self.index_path).await
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            DownloadError::storage(
                DownloadResult::TmpFileCannotRw,
                &self.tmp_path,
                "temp file is not open",
            )
        })?;
        file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
            DownloadError::storage(DownloadResult::TmpFileCannotSeek, &self.tmp_path, e.to_string())
        })?;
        file.write_all(buf).await.map_err(|e| {
            DownloadError::storage(DownloadResult::TmpFileCannotRw, &self.tmp_path, e.to_string())
        })?;
        Ok(())
    }

    // ---- shutdown ---------------------------------------------------------

    /// Apply the uncompleted-slice save policy and persist the index.
    pub async fn apply_save_policy(&self) -> Result<()> {
        match self.cfg.save_policy {
            UncompletedSliceSavePolicy::AlwaysDiscard => {
                {
                    let mut slices = self.slices.lock();
                    for slice in slices.iter_mut() {
                        slice.reset_progress();
                    }
                }
                self.total_downloaded.store(0, Ordering::Relaxed);
                // Discard the data bytes as well, re-holing the temp file.
                let mut guard = self.file.lock().await;
                if let Some(file) = guard.as_mut() {
                    let _ = file.set_len(0).await;
                    if let Some(size) = self.origin_file_size {
                        let _ = file.set_len(size).await;
                    }
                }
            }
            UncompletedSliceSavePolicy::SaveExceptFailed => {
                let mut cleared = 0u64;
                {
                    let mut slices = self.slices.lock();
                    for slice in slices.iter_mut() {
                        if slice.status() == SliceStatus::Failed {
                            cleared += slice.received();
                            slice.reset_progress();
                        }
                    }
                }
                self.total_downloaded.fetch_sub(cleared, Ordering::Relaxed);
            }
        }
        self.flush_index_file().await
    }

    /// Finalize the run: truncate, verify, rename, and drop the index.
    ///
    /// On an incomplete or failed run the save policy is applied instead and
    /// the resumable state stays on disk.
    pub async fn finish(&self, stop_requested: bool) -> Result<()> {
        self.flush_all_slices().await?;

        let completed = self.all_slices_completed() || self.check_all_completed_by_file_size();
        if !completed {
            if let Err(e) = self.apply_save_policy().await {
                tracing::warn!(error = %e, "failed to persist uncompleted slice state");
            }
            let permanently_failed = self
                .snapshots()
                .into_iter()
                .find(|s| s.status == SliceStatus::Failed && s.failed_times >= self.cfg.slice_max_failed_times);
            return Err(if stop_requested {
                DownloadError::Canceled
            } else if let Some(snap) = permanently_failed {
                DownloadError::SliceFailed {
                    index: snap.index,
                    attempts: snap.failed_times,
                }
            } else {
                DownloadError::Other("download ended before completion".into())
            });
        }

        {
            let mut guard = self.file.lock().await;
            let file = guard.as_mut().ok_or_else(|| {
                DownloadError::storage(
                    DownloadResult::TmpFileCannotRw,
                    &self.tmp_path,
                    "temp file is not open",
                )
            })?;
            match self.origin_file_size {
                Some(size) => {
                    let meta = file.metadata().await.map_err(|e| {
                        DownloadError::storage(
                            DownloadResult::TmpFileCannotRw,
                            &self.tmp_path,
                            e.to_string(),
                        )
                    })?;
                    if meta.len() < size {
                        return Err(DownloadError::storage(
                            DownloadResult::VerifyFileIntegrityFailed,
                            &self.tmp_path,
                            format!("temp file is {} bytes, expected {size}", meta.len()),
                        ));
                    }
                    file.set_len(size).await.map_err(|e| {
                        DownloadError::storage(
                            DownloadResult::TmpFileSizeError,
                            &self.tmp_path,
                            format!("truncate failed: {e}"),
                        )
                    })?;
                }
                None => {
                    let total = self.total_downloaded();
                    file.set_len(total).await.map_err(|e| {
                        DownloadError::storage(
                            DownloadResult::TmpFileSizeError,
                            &self.tmp_path,
                            format!("truncate failed: {e}"),
                        )
                    })?;
                }
            }
            file.flush().await.map_err(|e| {
                DownloadError::storage(
                    DownloadResult::TmpFileCannotRw,
                    &self.tmp_path,
                    e.to_string(),
                )
            })?;
            file.sync_all().await.map_err(|e| {
                DownloadError::storage(
                    DownloadResult::TmpFileCannotRw,
                    &self.tmp_path,
                    e.to_string(),
                )
            })?;
            // Close the handle before renaming.
            *guard = None;
        }

        if let HashVerifyPolicy::AlwaysVerify { hash_type, digest } = &self.cfg.hash_policy {
            let ok = checksum::verify_file_hash(&self.tmp_path, *hash_type, digest).await?;
            if !ok {
                let actual = checksum::compute_file_hash(&self.tmp_path, *hash_type)
                    .await
                    .unwrap_or_default();
                tracing::warn!(expected = %digest, %actual, "hash verification failed");
                if let Err(e) = self.apply_save_policy().await {
                    tracing::warn!(error = %e, "failed to persist slice state after hash mismatch");
                }
                return Err(DownloadError::HashMismatch {
                    expected: digest.clone(),
                    actual,
                });
            }
        }

        IndexFile::remove(&self.index_path).await;
        tokio::fs::rename(&self.tmp_path, &self.target_path)
            .await
            .map_err(|e| {
                DownloadError::storage(
                    DownloadResult::RenameTmpFileFailed,
                    &self.target_path,
                    format!("rename temp file failed: {e}"),
                )
            })?;
        tracing::debug!(target = %self.target_path.display(), "download finalized");
        Ok(())
    }
}

fn snapshot_of(slice: &Slice) -> SliceSnapshot {
    SliceSnapshot {
        index: slice.index(),
        begin: slice.begin(),
        end: slice.end(),
        downloaded: slice.downloaded(),
        received: slice.received(),
        status: slice.status(),
        failed_times: slice.failed_times(),
    }
}

/// Split `size` bytes into `n` near-equal contiguous ranges; remainder bytes
/// go one-per-slice to the lowest indices.
fn partition(size: u64, n: u64) -> Vec<Slice> {
    let n = n.min(size).max(1);
    let base = size / n;
    let remainder = size % n;
    let mut slices = Vec::with_capacity(n as usize);
    let mut begin = 0u64;
    for i in 0..n {
        let len = base + u64::from(i < remainder);
        let end = begin + len - 1;
        slices.push(Slice::new(i as usize, begin, Some(end)));
        begin = end + 1;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_with(
        dir: &TempDir,
        cfg: DownloadConfig,
        size: Option<u64>,
    ) -> SliceManager {
        SliceManager::new(
            Arc::new(cfg),
            "http://example.com/data.bin".into(),
            dir.path().join("data.bin"),
            size,
            String::new(),
        )
    }

    #[test]
    fn test_partition_even() {
        let slices = partition(100, 4);
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[0].begin(), 0);
        assert_eq!(slices[0].end(), Some(24));
        assert_eq!(slices[3].end(), Some(99));
        for pair in slices.windows(2) {
            assert_eq!(pair[0].end().unwrap() + 1, pair[1].begin());
        }
    }

    #[test]
    fn test_partition_remainder_goes_to_low_indices() {
        let slices = partition(10, 3);
        // 10 = 4 + 3 + 3
        assert_eq!(slices[0].capacity(), Some(4));
        assert_eq!(slices[1].capacity(), Some(3));
        assert_eq!(slices[2].capacity(), Some(3));
        assert_eq!(slices[2].end(), Some(9));
    }

    #[test]
    fn test_partition_never_exceeds_size() {
        let slices = partition(3, 8);
        assert_eq!(slices.len(), 3);
        assert!(slices.iter().all(|s| s.capacity() == Some(1)));
    }

    #[tokio::test]
    async fn test_make_slices_single_when_ranges_unsupported() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 4,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, Some(1024));
        mgr.make_slices(false).await.unwrap();
        assert_eq!(mgr.slice_count(), 1);
        let snap = mgr.snapshot(0).unwrap();
        assert_eq!(snap.end, Some(1023));
    }

    #[tokio::test]
    async fn test_make_slices_open_ended_when_size_unknown() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 4,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, None);
        mgr.make_slices(true).await.unwrap();
        assert_eq!(mgr.slice_count(), 1);
        assert_eq!(mgr.snapshot(0).unwrap().end, None);
    }

    #[tokio::test]
    async fn test_write_flush_and_index_round_trip() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 2,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg.clone(), Some(20));
        mgr.make_slices(true).await.unwrap();

        mgr.set_status(0, SliceStatus::Fetched);
        mgr.write_slice_data(0, b"0123456789").await.unwrap();
        mgr.set_status(1, SliceStatus::Fetched);
        mgr.write_slice_data(1, b"abcde").await.unwrap();
        mgr.flush_all_slices().await.unwrap();
        mgr.flush_index_file().await.unwrap();

        assert_eq!(mgr.total_downloaded(), 15);

        // A second manager against the same target resumes from the index.
        let mgr2 = manager_with(&dir, cfg, Some(20));
        mgr2.load_exist_slices().await.unwrap();
        assert_eq!(mgr2.total_downloaded(), 15);
        let snaps = mgr2.snapshots();
        assert_eq!(snaps[0].downloaded, 10);
        assert_eq!(snaps[0].status, SliceStatus::Completed);
        assert_eq!(snaps[1].downloaded, 5);
        assert_eq!(snaps[1].status, SliceStatus::Unfetch);

        // Bytes on disk match what was written.
        let data = std::fs::read(mgr2.tmp_path()).unwrap();
        assert_eq!(&data[0..10], b"0123456789");
        assert_eq!(&data[10..15], b"abcde");
    }

    #[tokio::test]
    async fn test_index_rejected_on_size_change() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig::default();
        let mgr = manager_with(&dir, cfg.clone(), Some(20));
        mgr.make_slices(true).await.unwrap();
        mgr.flush_index_file().await.unwrap();

        let mgr2 = manager_with(&dir, cfg, Some(30));
        let err = mgr2.load_exist_slices().await.unwrap_err();
        assert_eq!(err.code(), DownloadResult::TmpFileExpired);
    }

    #[tokio::test]
    async fn test_index_rejected_on_url_change() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig::default();
        let mgr = manager_with(&dir, cfg.clone(), Some(20));
        mgr.make_slices(true).await.unwrap();
        mgr.flush_index_file().await.unwrap();

        let mgr2 = SliceManager::new(
            Arc::new(cfg),
            "http://example.com/other.bin".into(),
            dir.path().join("data.bin"),
            Some(20),
            String::new(),
        );
        let err = mgr2.load_exist_slices().await.unwrap_err();
        assert_eq!(err.code(), DownloadResult::UrlDifferent);
    }

    #[tokio::test]
    async fn test_save_policy_always_discard() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 2,
            save_policy: UncompletedSliceSavePolicy::AlwaysDiscard,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, Some(20));
        mgr.make_slices(true).await.unwrap();
        mgr.write_slice_data(0, b"0123456789").await.unwrap();
        mgr.flush_all_slices().await.unwrap();

        mgr.apply_save_policy().await.unwrap();
        assert_eq!(mgr.total_downloaded(), 0);
        assert!(mgr.snapshots().iter().all(|s| s.downloaded == 0));

        let index = IndexFile::load(mgr.index_path()).await.unwrap();
        assert!(index.slices.iter().all(|r| r.downloaded == 0));
    }

    #[tokio::test]
    async fn test_save_policy_save_except_failed() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 2,
            save_policy: UncompletedSliceSavePolicy::SaveExceptFailed,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, Some(20));
        mgr.make_slices(true).await.unwrap();
        mgr.write_slice_data(0, b"0123456789").await.unwrap();
        mgr.write_slice_data(1, b"abcde").await.unwrap();
        mgr.flush_all_slices().await.unwrap();
        mgr.note_failed(1);

        mgr.apply_save_policy().await.unwrap();
        let snaps = mgr.snapshots();
        assert_eq!(snaps[0].downloaded, 10);
        assert_eq!(snaps[1].downloaded, 0);
        assert_eq!(mgr.total_downloaded(), 10);
    }

    #[tokio::test]
    async fn test_finish_renames_and_removes_index() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 1,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, Some(5));
        mgr.make_slices(true).await.unwrap();
        mgr.set_status(0, SliceStatus::Fetched);
        mgr.write_slice_data(0, b"hello").await.unwrap();
        mgr.set_status(0, SliceStatus::Completed);
        mgr.flush_index_file().await.unwrap();

        mgr.finish(false).await.unwrap();

        let target = dir.path().join("data.bin");
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!mgr.tmp_path().exists());
        assert!(!mgr.index_path().exists());
    }

    #[tokio::test]
    async fn test_finish_incomplete_is_canceled_when_stopped() {
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 2,
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, Some(20));
        mgr.make_slices(true).await.unwrap();
        mgr.write_slice_data(0, b"01234").await.unwrap();

        let err = mgr.finish(true).await.unwrap_err();
        assert_eq!(err.code(), DownloadResult::Canceled);
        // Resumable state stays behind.
        assert!(mgr.index_path().exists());
        assert!(mgr.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_finish_hash_mismatch() {
        use crate::types::HashType;
        let dir = TempDir::new().unwrap();
        let cfg = DownloadConfig {
            thread_count: 1,
            hash_policy: HashVerifyPolicy::AlwaysVerify {
                hash_type: HashType::Md5,
                digest: "00000000000000000000000000000000".into(),
            },
            ..Default::default()
        };
        let mgr = manager_with(&dir, cfg, Some(5));
        mgr.make_slices(true).await.unwrap();
        mgr.write_slice_data(0, b"hello").await.unwrap();
        mgr.set_status(0, SliceStatus::Completed);

        let err = mgr.finish(false).await.unwrap_err();
        assert_eq!(err.code(), DownloadResult::HashVerifyNotPass);
        // Not renamed.
        assert!(!dir.path().join("data.bin").exists());
        assert!(mgr.tmp_path().exists());
    }
}
