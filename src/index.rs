//! Durable slice index
//!
//! The index is a JSON sidecar next to the temp data file. Its presence on
//! disk means "resumable state exists"; it is rewritten only after the slice
//! buffers it describes have been flushed, and deleted only after a
//! successful finalization.

use crate::error::{DownloadError, DownloadResult, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-slice progress record as persisted on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRecord {
    /// Dense 0-based slice index.
    pub index: usize,
    /// First absolute byte of the slice, inclusive.
    pub begin: u64,
    /// Last absolute byte, inclusive; `None` for a to-EOF slice.
    pub end: Option<u64>,
    /// Bytes already flushed to the temp file for this slice.
    pub downloaded: u64,
}

/// On-disk description of a resumable download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFile {
    /// Final (post-redirect) URL the slices were fetched from.
    pub url: String,
    /// Probed size of the remote resource, when known.
    pub file_size: Option<u64>,
    /// `Content-MD5` reported by the server at probe time; may be empty.
    pub content_hash: String,
    /// Slice layout and progress, ordered by index.
    pub slices: Vec<SliceRecord>,
}

impl IndexFile {
    /// Sidecar path for a given temp data file.
    pub fn path_for(tmp_path: &Path) -> PathBuf {
        let mut os = tmp_path.as_os_str().to_owned();
        os.push(".index");
        PathBuf::from(os)
    }

    /// Load and structurally validate an index file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            DownloadError::storage(
                DownloadResult::OpenIndexFileFailed,
                path,
                format!("open index failed: {e}"),
            )
        })?;
        let index: IndexFile = serde_json::from_slice(&raw)?;
        index.check_layout()?;
        Ok(index)
    }

    /// Atomically rewrite the index: serialize to a sibling temp file, then
    /// rename over the old one.
    pub async fn store(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let staging = path.with_extension("index.tmp");
        tokio::fs::write(&staging, &data).await.map_err(|e| {
            DownloadError::storage(
                DownloadResult::OpenIndexFileFailed,
                &staging,
                format!("write index failed: {e}"),
            )
        })?;
        tokio::fs::rename(&staging, path).await.map_err(|e| {
            DownloadError::storage(
                DownloadResult::OpenIndexFileFailed,
                path,
                format!("replace index failed: {e}"),
            )
        })?;
        Ok(())
    }

    /// Delete the index file if present.
    pub async fn remove(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove index file");
            }
        }
    }

    /// Slice ranges must be dense, ordered and disjoint, with at most the
    /// last slice open-ended.
    fn check_layout(&self) -> Result<()> {
        let reject = |reason: &str| {
            Err(DownloadError::IndexRejected {
                code: DownloadResult::InvalidIndexFormat,
                reason: reason.to_string(),
            })
        };
        if self.slices.is_empty() {
            return reject("no slices");
        }
        let mut expected_begin = 0u64;
        for (i, rec) in self.slices.iter().enumerate() {
            if rec.index != i {
                return reject("slice indices are not dense");
            }
            if rec.begin != expected_begin {
                return reject("slice ranges are not contiguous");
            }
            match rec.end {
                Some(end) => {
                    if end < rec.begin {
                        return reject("slice end precedes begin");
                    }
                    let capacity = end - rec.begin + 1;
                    if rec.downloaded > capacity {
                        return reject("slice progress exceeds capacity");
                    }
                    expected_begin = end + 1;
                }
                None => {
                    if i != self.slices.len() - 1 {
                        return reject("open-ended slice must be last");
                    }
                }
            }
        }
        if let (Some(size), Some(Some(last_end))) =
            (self.file_size, self.slices.last().map(|r| r.end))
        {
            if last_end + 1 != size {
                return reject("slice union does not cover the file");
            }
        }
        Ok(())
    }
}
