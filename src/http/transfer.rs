//! Single-slice range transfer
//!
//! One task per slice: issue the ranged GET, stream the body through the
//! optional per-slice rate limiter, and push chunks into the coordinator's
//! event channel. The task never touches slice state; completion is
//! reported as a `Done` event and demuxed by slice index.

use super::TransferEvent;
use bytes::Bytes;
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use thiserror::Error;
use tokio::sync::mpsc;

/// Rate-limiter acquisition granularity (16 KiB).
const THROTTLE_CHUNK: u32 = 16 * 1024;

/// What the coordinator needs to start one slice transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Slice index, used to demux events.
    pub slice: usize,
    /// Resolved URL to fetch from.
    pub url: String,
    /// Absolute resume position (slice begin plus bytes already on disk).
    pub offset: u64,
    /// Last byte of the slice, inclusive; `None` requests to EOF.
    pub end: Option<u64>,
    /// Per-slice speed cap in bytes/s.
    pub max_speed: Option<u64>,
}

/// Why a slice transfer ended unsuccessfully.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
    /// The server replied 200 with a full body to a non-zero range request.
    #[error("server ignored the range request")]
    RangeIgnored,
    #[error("network error: {0}")]
    Network(String),
}

/// `Range` header value for a resume position.
pub fn range_header_value(offset: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={offset}-{end}"),
        None => format!("bytes={offset}-"),
    }
}

/// Entry point for a spawned transfer task.
pub(crate) async fn run(
    client: Client,
    request: TransferRequest,
    tx: mpsc::Sender<TransferEvent>,
) {
    let slice = request.slice;
    let result = run_inner(&client, &request, &tx).await;
    if let Err(e) = &result {
        tracing::debug!(slice, error = %e, "slice transfer failed");
    }
    let _ = tx.send(TransferEvent::Done { slice, result }).await;
}

async fn run_inner(
    client: &Client,
    request: &TransferRequest,
    tx: &mpsc::Sender<TransferEvent>,
) -> Result<(), TransferError> {
    let limiter = request
        .max_speed
        .and_then(|bps| NonZeroU32::new(bps.min(u32::MAX as u64) as u32))
        .map(|bps| {
            // Burst must cover one acquisition step even for small quotas.
            let burst = NonZeroU32::new(bps.get().max(THROTTLE_CHUNK)).unwrap_or(bps);
            RateLimiter::direct(Quota::per_second(bps).allow_burst(burst))
        });

    let response = client
        .get(&request.url)
        .header(
            reqwest::header::RANGE,
            range_header_value(request.offset, request.end),
        )
        .send()
        .await
        .map_err(|e| TransferError::Network(e.to_string()))?;

    match response.status().as_u16() {
        206 => {}
        // A server that ignores Range sends the whole file. That is only
        // recoverable when this slice starts at byte zero; the slice's
        // capacity clamp bounds what gets written.
        200 if request.offset == 0 => {}
        200 => return Err(TransferError::RangeIgnored),
        code => return Err(TransferError::HttpStatus(code)),
    }

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk.map_err(|e| TransferError::Network(e.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        throttle(&limiter, chunk.len() as u64).await;
        if tx
            .send(TransferEvent::Chunk {
                slice: request.slice,
                data: chunk,
            })
            .await
            .is_err()
        {
            // Coordinator is gone; the run is tearing down.
            return Ok(());
        }
    }

    Ok(())
}

/// Wait for rate-limiter permission in 16 KiB steps.
async fn throttle(limiter: &Option<DefaultDirectRateLimiter>, bytes: u64) {
    let (Some(limiter), Some(step)) = (limiter, NonZeroU32::new(THROTTLE_CHUNK)) else {
        return;
    };
    let steps = (bytes / THROTTLE_CHUNK as u64).max(1) as u32;
    for _ in 0..steps {
        let _ = limiter.until_n_ready(step).await;
    }
}
