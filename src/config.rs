//! Download configuration
//!
//! All tuning options for a single download run. The configuration is
//! immutable once a run starts; validation happens synchronously inside
//! `Downloader::start` and maps each violation onto its result code.

use crate::error::{DownloadError, DownloadResult, Result};
use crate::event::EventFlag;
use crate::types::{HashVerifyPolicy, UncompletedSliceSavePolicy, VerboseCallback};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Hard ceiling on the number of slices a run may create.
pub const MAX_SLICE_COUNT: u32 = 100;

/// Upper bound on the aggregate RAM cache across slices (1 GiB).
pub const MAX_DISK_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

/// Upper bound on network timeouts (10 minutes).
pub const MAX_NETWORK_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound on probe retries.
pub const MAX_FETCH_FILE_INFO_RETRY: u32 = 10;

/// Options for one download run.
#[derive(Clone)]
pub struct DownloadConfig {
    /// Concurrency ceiling; `0` resolves to the available parallelism.
    pub thread_count: u32,
    /// Total RAM cache budget split across active slices.
    pub disk_cache_size: u64,
    /// Aggregate speed cap in bytes/s; `None` means unlimited.
    pub max_speed: Option<u64>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-read inactivity timeout.
    pub read_timeout: Duration,
    /// How many times the file-info probe is retried before giving up.
    pub fetch_file_info_retry: u32,
    /// How many times a single slice may fail before it is abandoned.
    pub slice_max_failed_times: u32,
    /// Integrity check over the finished file.
    pub hash_policy: HashVerifyPolicy,
    /// Fate of partial slices on a non-success termination.
    pub save_policy: UncompletedSliceSavePolicy,
    /// Extra request headers applied to the probe and every slice transfer.
    pub http_headers: Vec<(String, String)>,
    /// Cookie header value, e.g. `"session=abc; token=xyz"`.
    pub cookies: Option<String>,
    /// Proxy URL (`http://`, `https://` or `socks5://`).
    pub proxy: Option<String>,
    /// Extra CA bundle (PEM) trusted in addition to the system roots.
    pub ca_path: Option<PathBuf>,
    /// Verify the server certificate chain.
    pub verify_peer_certificate: bool,
    /// Verify that the certificate matches the host name.
    pub verify_peer_host: bool,
    /// Probe with HEAD instead of a bodyless GET.
    pub use_head_method: bool,
    /// External cancellation flag supplied by the caller.
    pub user_stop_event: Option<Arc<EventFlag>>,
    /// Diagnostic message sink.
    pub verbose: Option<VerboseCallback>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            disk_cache_size: 20 * 1024 * 1024,
            max_speed: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            fetch_file_info_retry: 3,
            slice_max_failed_times: 3,
            hash_policy: HashVerifyPolicy::Never,
            save_policy: UncompletedSliceSavePolicy::AlwaysDiscard,
            http_headers: Vec::new(),
            cookies: None,
            proxy: None,
            ca_path: None,
            verify_peer_certificate: true,
            verify_peer_host: true,
            use_head_method: false,
            user_stop_event: None,
            verbose: None,
        }
    }
}

impl std::fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("thread_count", &self.thread_count)
            .field("disk_cache_size", &self.disk_cache_size)
            .field("max_speed", &self.max_speed)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("fetch_file_info_retry", &self.fetch_file_info_retry)
            .field("slice_max_failed_times", &self.slice_max_failed_times)
            .field("hash_policy", &self.hash_policy)
            .field("save_policy", &self.save_policy)
            .field("http_headers", &self.http_headers)
            .field("proxy", &self.proxy)
            .field("use_head_method", &self.use_head_method)
            .finish_non_exhaustive()
    }
}

impl DownloadConfig {
    /// Resolve the effective slice concurrency.
    ///
    /// `0` means auto: the machine's available parallelism, clamped to 16.
    pub fn resolved_thread_count(&self) -> u32 {
        if self.thread_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
                .clamp(1, 16)
        } else {
            self.thread_count
        }
    }

    /// Validate every tunable, mapping each violation onto its result code.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count > MAX_SLICE_COUNT {
            return Err(DownloadError::invalid_option(
                "thread_count",
                DownloadResult::InvalidThreadNum,
                format!("must be <= {MAX_SLICE_COUNT}"),
            ));
        }
        if self.disk_cache_size > MAX_DISK_CACHE_SIZE {
            return Err(DownloadError::invalid_option(
                "disk_cache_size",
                DownloadResult::InvalidDiskCacheSize,
                format!("must be <= {MAX_DISK_CACHE_SIZE} bytes"),
            ));
        }
        if self.connect_timeout.is_zero() || self.connect_timeout > MAX_NETWORK_TIMEOUT {
            return Err(DownloadError::invalid_option(
                "connect_timeout",
                DownloadResult::InvalidNetworkConnTimeout,
                "must be non-zero and at most 10 minutes",
            ));
        }
        if self.read_timeout.is_zero() || self.read_timeout > MAX_NETWORK_TIMEOUT {
            return Err(DownloadError::invalid_option(
                "read_timeout",
                DownloadResult::InvalidNetworkReadTimeout,
                "must be non-zero and at most 10 minutes",
            ));
        }
        if self.fetch_file_info_retry > MAX_FETCH_FILE_INFO_RETRY {
            return Err(DownloadError::invalid_option(
                "fetch_file_info_retry",
                DownloadResult::InvalidFetchFileInfoRetryTimes,
                format!("must be <= {MAX_FETCH_FILE_INFO_RETRY}"),
            ));
        }
        if let HashVerifyPolicy::AlwaysVerify { digest, .. } = &self.hash_policy {
            if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DownloadError::invalid_option(
                    "hash_policy",
                    DownloadResult::InvalidHashPolicy,
                    "expected digest must be a non-empty hex string",
                ));
            }
        }
        for (name, _) in &self.http_headers {
            if name.trim().is_empty() {
                return Err(DownloadError::invalid_option(
                    "http_headers",
                    DownloadResult::InvalidHttpHeaders,
                    "header name must not be empty",
                ));
            }
        }
        if let Some(proxy) = &self.proxy {
            if reqwest::Proxy::all(proxy.as_str()).is_err() {
                return Err(DownloadError::invalid_option(
                    "proxy",
                    DownloadResult::InvalidProxy,
                    format!("unusable proxy url: {proxy}"),
                ));
            }
        }
        Ok(())
    }

    /// Emit a diagnostic message through the verbose sink, if installed.
    pub fn emit_verbose(&self, msg: &str) {
        if let Some(cb) = &self.verbose {
            cb(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HashType;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DownloadConfig::default().validate().is_ok());
    }

    #[test]
    fn test_resolved_thread_count_auto() {
        let cfg = DownloadConfig::default();
        let n = cfg.resolved_thread_count();
        assert!((1..=16).contains(&n));

        let cfg = DownloadConfig {
            thread_count: 7,
            ..Default::default()
        };
        assert_eq!(cfg.resolved_thread_count(), 7);
    }

    #[test]
    fn test_thread_count_bound() {
        let cfg = DownloadConfig {
            thread_count: MAX_SLICE_COUNT + 1,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidThreadNum);
    }

    #[test]
    fn test_zero_connect_timeout_rejected() {
        let cfg = DownloadConfig {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidNetworkConnTimeout);
    }

    #[test]
    fn test_hash_policy_requires_hex_digest() {
        let cfg = DownloadConfig {
            hash_policy: HashVerifyPolicy::AlwaysVerify {
                hash_type: HashType::Md5,
                digest: "not-hex!".into(),
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidHashPolicy);
    }

    #[test]
    fn test_empty_header_name_rejected() {
        let cfg = DownloadConfig {
            http_headers: vec![("".into(), "x".into())],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidHttpHeaders);
    }
}
