//! Integrity verification for downloaded files
//!
//! Streams the finished file through the configured digest and compares it
//! against the expected value.

use crate::error::{DownloadError, DownloadResult, Result};
use crate::types::HashType;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Verify a file's digest against an expected hex value.
///
/// Returns `Ok(true)` on a match, `Ok(false)` on a clean mismatch, and an
/// error only when the file cannot be read.
pub async fn verify_file_hash(path: &Path, hash_type: HashType, expected: &str) -> Result<bool> {
    let computed = compute_file_hash(path, hash_type).await?;
    Ok(computed.eq_ignore_ascii_case(expected))
}

/// Compute the hex-encoded digest of a file.
pub async fn compute_file_hash(path: &Path, hash_type: HashType) -> Result<String> {
    let mut file = File::open(path).await.map_err(|e| {
        DownloadError::storage(
            DownloadResult::CalculateHashFailed,
            path,
            format!("open for hashing failed: {e}"),
        )
    })?;

    let mut buffer = vec![0u8; 64 * 1024];
    let mut hasher = Hasher::new(hash_type);
    loop {
        let n = file.read(&mut buffer).await.map_err(|e| {
            DownloadError::storage(
                DownloadResult::CalculateHashFailed,
                path,
                format!("read for hashing failed: {e}"),
            )
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_hex())
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(hash_type: HashType) -> Self {
        match hash_type {
            HashType::Md5 => Self::Md5(Md5::new()),
            HashType::Sha1 => Self::Sha1(Sha1::new()),
            HashType::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_md5_digest() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let computed = compute_file_hash(file.path(), HashType::Md5).await.unwrap();
        assert_eq!(computed, "65a8e27d8879283831b664bd8b7f0ad4");
    }

    #[tokio::test]
    async fn test_sha256_digest() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let computed = compute_file_hash(file.path(), HashType::Sha256)
            .await
            .unwrap();
        assert_eq!(
            computed,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[tokio::test]
    async fn test_verify_is_case_insensitive() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        assert!(
            verify_file_hash(file.path(), HashType::Md5, "65A8E27D8879283831B664BD8B7F0AD4")
                .await
                .unwrap()
        );
        assert!(
            !verify_file_hash(file.path(), HashType::Md5, "00000000000000000000000000000000")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let err = compute_file_hash(Path::new("/nonexistent/x"), HashType::Sha1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::CalculateHashFailed);
    }
}
