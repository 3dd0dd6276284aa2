//! HTTP transport layer
//!
//! Builds the per-run `reqwest` client from the download options and hosts
//! the multiplexed transfer pool: one spawned task per slice transfer, all
//! streaming their bytes and completion results into a single bounded
//! channel consumed by the coordinator. The bounded channel is what turns
//! a slow disk into transport backpressure.

pub mod probe;
pub mod transfer;

pub use transfer::{TransferError, TransferRequest};

use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Completion and data events produced by transfer tasks.
#[derive(Debug)]
pub enum TransferEvent {
    /// A chunk of body bytes for one slice.
    Chunk { slice: usize, data: Bytes },
    /// The transfer for one slice ended, cleanly or not.
    Done {
        slice: usize,
        result: std::result::Result<(), TransferError>,
    },
}

/// Build the HTTP client for a run.
///
/// Compression is deliberately left off: slice transfers address raw bytes
/// by Range, and transparent decoding would break both offsets and the
/// probed content length.
pub fn build_client(cfg: &DownloadConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &cfg.http_headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            DownloadError::invalid_option(
                "http_headers",
                DownloadResult::InvalidHttpHeaders,
                format!("bad header name '{name}': {e}"),
            )
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            DownloadError::invalid_option(
                "http_headers",
                DownloadResult::InvalidHttpHeaders,
                format!("bad header value: {e}"),
            )
        })?;
        headers.insert(name, value);
    }
    if let Some(cookies) = &cfg.cookies {
        let value = HeaderValue::from_str(cookies).map_err(|e| {
            DownloadError::invalid_option(
                "cookies",
                DownloadResult::InvalidHttpHeaders,
                format!("bad cookie value: {e}"),
            )
        })?;
        headers.insert(reqwest::header::COOKIE, value);
    }

    let mut builder = Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .read_timeout(cfg.read_timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .default_headers(headers);

    if !cfg.verify_peer_certificate || !cfg.verify_peer_host {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(ca_path) = &cfg.ca_path {
        let pem = std::fs::read(ca_path).map_err(|e| {
            DownloadError::storage(
                DownloadResult::InitTransportFailed,
                ca_path,
                format!("read CA bundle failed: {e}"),
            )
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            DownloadError::invalid_option(
                "ca_path",
                DownloadResult::InitTransportFailed,
                format!("bad CA bundle: {e}"),
            )
        })?;
        builder = builder.add_root_certificate(cert);
    }

    if let Some(proxy) = &cfg.proxy {
        let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
            DownloadError::invalid_option(
                "proxy",
                DownloadResult::InvalidProxy,
                format!("unusable proxy url: {e}"),
            )
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| {
        DownloadError::invalid_option(
            "transport",
            DownloadResult::InitTransportFailed,
            e.to_string(),
        )
    })
}

/// Multiplexed container for concurrent slice transfers.
///
/// Owned by the coordinator; all events funnel into one receiver so slice
/// state is only ever mutated from the coordinator task.
pub struct TransferPool {
    client: Client,
    tx: mpsc::Sender<TransferEvent>,
    rx: mpsc::Receiver<TransferEvent>,
    tasks: HashMap<usize, JoinHandle<()>>,
}

impl TransferPool {
    /// `queue_depth` bounds the number of in-flight chunks across all
    /// transfers; senders block when the coordinator falls behind.
    pub fn new(client: Client, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Self {
            client,
            tx,
            rx,
            tasks: HashMap::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Spawn a transfer task for one slice.
    pub fn add(&mut self, request: TransferRequest) -> Result<()> {
        if self.tasks.contains_key(&request.slice) {
            return Err(DownloadError::invalid_option(
                "transfer",
                DownloadResult::AddTransferFailed,
                format!("slice {} already has a transfer", request.slice),
            ));
        }
        let slice = request.slice;
        let handle = tokio::spawn(transfer::run(
            self.client.clone(),
            request,
            self.tx.clone(),
        ));
        self.tasks.insert(slice, handle);
        Ok(())
    }

    /// Detach a finished or unwanted transfer.
    pub fn remove(&mut self, slice: usize) {
        if let Some(handle) = self.tasks.remove(&slice) {
            handle.abort();
        }
    }

    /// Number of transfers currently attached.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Wait up to `timeout` for the next transfer event.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<TransferEvent> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Abort every attached transfer.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for TransferPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_defaults() {
        let cfg = DownloadConfig::default();
        assert!(build_client(&cfg).is_ok());
    }

    #[test]
    fn test_bad_header_name_rejected() {
        let cfg = DownloadConfig {
            http_headers: vec![("bad header".into(), "v".into())],
            ..Default::default()
        };
        let err = build_client(&cfg).unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidHttpHeaders);
    }

    #[test]
    fn test_bad_proxy_rejected() {
        let cfg = DownloadConfig {
            proxy: Some("::not a proxy::".into()),
            ..Default::default()
        };
        let err = build_client(&cfg).unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidProxy);
    }

    #[tokio::test]
    async fn test_duplicate_transfer_rejected() {
        let client = Client::new();
        let mut pool = TransferPool::new(client, 4);
        let request = TransferRequest {
            slice: 0,
            url: "http://127.0.0.1:1/never".into(),
            offset: 0,
            end: Some(9),
            max_speed: None,
        };
        pool.add(request.clone()).unwrap();
        let err = pool.add(request).unwrap_err();
        assert_eq!(err.code(), DownloadResult::AddTransferFailed);
        pool.shutdown();
    }
}
