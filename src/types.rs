//! Core types for slice-dl

use crate::error::DownloadResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Current state of a downloader, visible to the caller at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// No run in progress (initial state, and after every run ends).
    Stopped,
    /// A run is actively transferring slices.
    Downloading,
    /// A run exists but is paused; no replenishment happens.
    Paused,
}

/// What the probe learned about the remote resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Content length; `None` when the server did not report one.
    pub file_size: Option<u64>,
    /// `Content-MD5` response header, verbatim; empty when absent.
    pub content_md5: String,
    /// Final URL after redirects, when it differs from the request URL.
    pub redirect_url: Option<String>,
    /// False only when the server answered `Accept-Ranges: none`.
    pub accept_ranges: bool,
}

impl FileInfo {
    pub fn new() -> Self {
        Self {
            accept_ranges: true,
            ..Default::default()
        }
    }
}

/// Digest algorithm for the integrity check over the finished file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Md5,
    Sha1,
    Sha256,
}

impl std::fmt::Display for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

/// Whether, and against what, the finished file is hash-verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashVerifyPolicy {
    /// Skip verification entirely.
    Never,
    /// Compute the digest over the final file and require an exact match.
    AlwaysVerify {
        hash_type: HashType,
        digest: String,
    },
}

impl Default for HashVerifyPolicy {
    fn default() -> Self {
        Self::Never
    }
}

/// What happens to partially downloaded slices on a non-success termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncompletedSliceSavePolicy {
    /// Reset every slice's progress to zero.
    #[default]
    AlwaysDiscard,
    /// Keep each slice's progress, except slices that ended in failure.
    SaveExceptFailed,
}

/// Aggregate progress snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressInfo {
    /// Total size of the resource; `None` until/unless the server told us.
    pub total: Option<u64>,
    /// Bytes received so far across all slices (buffered plus on disk).
    pub downloaded: u64,
}

/// Invoked exactly once when a run terminates.
pub type ResultCallback = Box<dyn FnOnce(DownloadResult) + Send + 'static>;

/// Invoked periodically with `(total, downloaded)`.
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync + 'static>;

/// Invoked periodically with the aggregate speed in bytes per second.
pub type SpeedCallback = Arc<dyn Fn(u64) + Send + Sync + 'static>;

/// Diagnostic sink; messages never alter control flow.
pub type VerboseCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;
