//! Remote resource probe
//!
//! One preliminary request resolves the final URL, content length,
//! `Content-MD5`, and whether the server honors `Range` requests. When HEAD
//! is refused the probe falls back to a one-byte ranged GET and reads the
//! total size out of `Content-Range`.

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Result};
use crate::event::StopToken;
use crate::types::FileInfo;
use rand::Rng;
use reqwest::{Client, Response};
use std::time::Duration;

/// Base delay between probe retries; doubles per attempt, capped at 2s.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Fetch the remote file info, retrying per the configuration.
///
/// Fails fast with `Canceled` whenever either stop event is raised.
pub(crate) async fn fetch_with_retry(
    client: &Client,
    cfg: &DownloadConfig,
    url: &str,
    stop: &StopToken,
) -> Result<FileInfo> {
    let mut attempt: u32 = 0;
    loop {
        if stop.is_stopped() {
            return Err(DownloadError::Canceled);
        }

        let outcome = tokio::select! {
            r = fetch_once(client, cfg, url) => r,
            _ = stop.stopped() => return Err(DownloadError::Canceled),
        };

        match outcome {
            Ok(info) => return Ok(info),
            Err(e) => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "file info fetch failed");
                cfg.emit_verbose(&format!("fetch file info failed (attempt {attempt}): {e}"));
                if attempt > cfg.fetch_file_info_retry {
                    return Err(DownloadError::Probe(e.to_string()));
                }
                if stop.wait(retry_delay(attempt)).await {
                    return Err(DownloadError::Canceled);
                }
            }
        }
    }
}

/// Exponential backoff with +/-25% jitter.
fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY
        .saturating_mul(1u32 << attempt.min(4))
        .min(RETRY_MAX_DELAY);
    let jitter = 1.0 + (rand::thread_rng().gen::<f64>() - 0.5) * 0.5;
    base.mul_f64(jitter)
}

/// Issue a single probe request and interpret the response headers.
async fn fetch_once(client: &Client, cfg: &DownloadConfig, url: &str) -> Result<FileInfo> {
    let request = if cfg.use_head_method {
        client.head(url)
    } else {
        client.get(url)
    };
    let response = request.send().await?;

    let status = response.status().as_u16();
    if status != 200 && status != 206 {
        // Some servers refuse HEAD outright; learn the size from a
        // one-byte ranged GET instead.
        if cfg.use_head_method && matches!(status, 403 | 405 | 501) {
            return fetch_ranged(client, url).await;
        }
        return Err(DownloadError::Transport {
            message: format!("probe returned http status {status}"),
            retryable: status >= 500,
        });
    }

    Ok(file_info_from_response(url, &response))
}

/// Probe with `Range: bytes=0-0`, reading the size out of `Content-Range`.
async fn fetch_ranged(client: &Client, url: &str) -> Result<FileInfo> {
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-0")
        .send()
        .await?;

    let status = response.status().as_u16();
    if status != 200 && status != 206 {
        return Err(DownloadError::Transport {
            message: format!("ranged probe returned http status {status}"),
            retryable: status >= 500,
        });
    }

    let mut info = file_info_from_response(url, &response);
    if status == 206 {
        info.accept_ranges = true;
        info.file_size = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .and_then(|(_, _, total)| total);
    }
    Ok(info)
}

fn file_info_from_response(requested_url: &str, response: &Response) -> FileInfo {
    let headers = response.headers();
    let mut info = FileInfo::new();

    info.file_size = headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());

    info.content_md5 = headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    // Absence of Accept-Ranges is treated as range support; only an
    // explicit "none" turns slicing off.
    info.accept_ranges = headers
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().eq_ignore_ascii_case("none"))
        .unwrap_or(true);

    let final_url = response.url().as_str();
    if final_url != requested_url {
        info.redirect_url = Some(final_url.to_string());
    }

    info
}

/// Parse a `Content-Range` header: `bytes start-end/total` or `bytes
/// start-end/*`. Returns `(start, end, total)`.
pub(crate) fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };
    Some((start, end, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-0/4096"),
            Some((0, 0, Some(4096)))
        );
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some((100, 199, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 0-99/*"), Some((0, 99, None)));
        assert_eq!(parse_content_range("invalid"), None);
        assert_eq!(parse_content_range("bytes nonsense"), None);
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        for attempt in 1..=8 {
            let d = retry_delay(attempt);
            assert!(d >= RETRY_BASE_DELAY.mul_f64(0.7));
            assert!(d <= RETRY_MAX_DELAY.mul_f64(1.3));
        }
    }
}
