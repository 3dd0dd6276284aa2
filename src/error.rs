//! Typed error hierarchy for slice-dl
//!
//! Every error carries enough context to map onto the terminal
//! [`DownloadResult`] code reported to the caller exactly once per run.

use std::path::PathBuf;
use thiserror::Error;

/// Terminal result codes for a download run.
///
/// The result callback (and the awaited run handle) receives exactly one of
/// these. `Success` is the only non-error code; everything else describes
/// why the run stopped short of producing the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadResult {
    Success,
    UnknownError,
    Canceled,
    InvalidUrl,
    InvalidIndexFormat,
    InvalidTargetFilePath,
    InvalidThreadNum,
    InvalidHashPolicy,
    InvalidSlicePolicy,
    InvalidNetworkConnTimeout,
    InvalidNetworkReadTimeout,
    InvalidFetchFileInfoRetryTimes,
    InvalidDiskCacheSize,
    InvalidRedirectedUrl,
    InvalidHttpHeaders,
    InvalidProxy,
    AlreadyDownloading,
    InitTransportFailed,
    InitMultiTransferFailed,
    SetTransferOptionFailed,
    AddTransferFailed,
    CreateTargetFileFailed,
    CreateTmpFileFailed,
    OpenTmpFileFailed,
    UrlDifferent,
    TmpFileExpired,
    InitTmpFileFailed,
    TmpFileCannotRw,
    HashVerifyNotPass,
    CalculateHashFailed,
    FetchFileInfoFailed,
    RenameTmpFileFailed,
    OpenIndexFileFailed,
    TmpFileSizeError,
    TmpFileCannotSeek,
    VerifyFileIntegrityFailed,
    SliceDownloadFailed,
}

impl DownloadResult {
    /// Whether this code represents a finished, verified download.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Stable string form, useful for logs and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnknownError => "UnknownError",
            Self::Canceled => "Canceled",
            Self::InvalidUrl => "InvalidUrl",
            Self::InvalidIndexFormat => "InvalidIndexFormat",
            Self::InvalidTargetFilePath => "InvalidTargetFilePath",
            Self::InvalidThreadNum => "InvalidThreadNum",
            Self::InvalidHashPolicy => "InvalidHashPolicy",
            Self::InvalidSlicePolicy => "InvalidSlicePolicy",
            Self::InvalidNetworkConnTimeout => "InvalidNetworkConnTimeout",
            Self::InvalidNetworkReadTimeout => "InvalidNetworkReadTimeout",
            Self::InvalidFetchFileInfoRetryTimes => "InvalidFetchFileInfoRetryTimes",
            Self::InvalidDiskCacheSize => "InvalidDiskCacheSize",
            Self::InvalidRedirectedUrl => "InvalidRedirectedUrl",
            Self::InvalidHttpHeaders => "InvalidHttpHeaders",
            Self::InvalidProxy => "InvalidProxy",
            Self::AlreadyDownloading => "AlreadyDownloading",
            Self::InitTransportFailed => "InitTransportFailed",
            Self::InitMultiTransferFailed => "InitMultiTransferFailed",
            Self::SetTransferOptionFailed => "SetTransferOptionFailed",
            Self::AddTransferFailed => "AddTransferFailed",
            Self::CreateTargetFileFailed => "CreateTargetFileFailed",
            Self::CreateTmpFileFailed => "CreateTmpFileFailed",
            Self::OpenTmpFileFailed => "OpenTmpFileFailed",
            Self::UrlDifferent => "UrlDifferent",
            Self::TmpFileExpired => "TmpFileExpired",
            Self::InitTmpFileFailed => "InitTmpFileFailed",
            Self::TmpFileCannotRw => "TmpFileCannotRw",
            Self::HashVerifyNotPass => "HashVerifyNotPass",
            Self::CalculateHashFailed => "CalculateHashFailed",
            Self::FetchFileInfoFailed => "FetchFileInfoFailed",
            Self::RenameTmpFileFailed => "RenameTmpFileFailed",
            Self::OpenIndexFileFailed => "OpenIndexFileFailed",
            Self::TmpFileSizeError => "TmpFileSizeError",
            Self::TmpFileCannotSeek => "TmpFileCannotSeek",
            Self::VerifyFileIntegrityFailed => "VerifyFileIntegrityFailed",
            Self::SliceDownloadFailed => "SliceDownloadFailed",
        }
    }
}

impl std::fmt::Display for DownloadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal error type for the download engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Invalid option detected synchronously at `start`.
    #[error("invalid option '{field}': {message}")]
    InvalidOption {
        field: &'static str,
        code: DownloadResult,
        message: String,
    },

    /// Probe (file-info fetch) failed after all retries.
    #[error("fetch file info failed: {0}")]
    Probe(String),

    /// Transport-level failure on a slice transfer or the probe request.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// Filesystem failure on the temp file, target file or index file.
    #[error("storage error at {path:?}: {message}")]
    Storage {
        code: DownloadResult,
        path: PathBuf,
        message: String,
    },

    /// The sidecar index exists but cannot be used for resumption.
    #[error("index rejected: {reason}")]
    IndexRejected {
        code: DownloadResult,
        reason: String,
    },

    /// Digest of the finished file does not match the expected digest.
    #[error("hash verify failed: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Run stopped by the internal or user stop event.
    #[error("download canceled")]
    Canceled,

    /// A slice exhausted its retry budget and the file cannot complete.
    #[error("slice {index} failed permanently after {attempts} attempts")]
    SliceFailed { index: usize, attempts: u32 },

    /// Catch-all for states the engine cannot attribute more precisely.
    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    /// Map this error onto the externally visible result code.
    pub fn code(&self) -> DownloadResult {
        match self {
            Self::InvalidOption { code, .. } => *code,
            Self::Probe(_) => DownloadResult::FetchFileInfoFailed,
            Self::Transport { .. } => DownloadResult::SliceDownloadFailed,
            Self::Storage { code, .. } => *code,
            Self::IndexRejected { code, .. } => *code,
            Self::HashMismatch { .. } => DownloadResult::HashVerifyNotPass,
            Self::Canceled => DownloadResult::Canceled,
            Self::SliceFailed { .. } => DownloadResult::SliceDownloadFailed,
            Self::Other(_) => DownloadResult::UnknownError,
        }
    }

    /// Build a storage error with its result code and offending path.
    pub fn storage(
        code: DownloadResult,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            code,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build an invalid-option error for `start`-time validation.
    pub fn invalid_option(
        field: &'static str,
        code: DownloadResult,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            field,
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DownloadError>;

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            code: DownloadResult::TmpFileCannotRw,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        Self::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidOption {
            field: "url",
            code: DownloadResult::InvalidUrl,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::IndexRejected {
            code: DownloadResult::InvalidIndexFormat,
            reason: err.to_string(),
        }
    }
}
