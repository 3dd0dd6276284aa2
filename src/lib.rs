//! # slice-dl
//!
//! A resumable, multi-slice HTTP/HTTPS download engine.
//!
//! ## Features
//!
//! - **Sliced transfers**: the resource is probed for size and `Range`
//!   support, partitioned into byte-range slices and downloaded concurrently
//! - **Durable resume**: per-slice progress is persisted to a sidecar index
//!   so interrupted transfers continue across process restarts
//! - **Atomic finalization**: data lands in a `.part` temp file that is
//!   truncated, hash-verified and renamed into place only on success
//! - **Bounded memory**: every slice stages bytes through a capped RAM
//!   buffer; the cap is the backpressure signal to the transport
//! - **Async**: built on Tokio and reqwest
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slice_dl::{DownloadConfig, Downloader};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DownloadConfig {
//!         thread_count: 4,
//!         ..Default::default()
//!     };
//!     let downloader = Downloader::new(config);
//!
//!     let handle = downloader
//!         .start(
//!             "https://example.com/file.zip",
//!             "/tmp/file.zip",
//!             None,
//!             Some(std::sync::Arc::new(|p: slice_dl::ProgressInfo| {
//!                 if let Some(total) = p.total {
//!                     println!("{}/{} bytes", p.downloaded, total);
//!                 }
//!             })),
//!             None,
//!         )
//!         .expect("options are valid");
//!
//!     let result = handle.await;
//!     println!("finished: {result}");
//! }
//! ```

// Modules
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod http;
pub mod index;
pub mod manager;
pub mod observer;
pub mod slice;
pub mod types;

// Re-exports for convenience
pub use config::DownloadConfig;
pub use engine::{DownloadHandle, Downloader};
pub use error::{DownloadError, DownloadResult, Result};
pub use event::{EventFlag, Stopwatch};
pub use index::{IndexFile, SliceRecord};
pub use manager::{SliceManager, SliceSnapshot};
pub use slice::{Slice, SliceStatus};
pub use types::{
    DownloadState, FileInfo, HashType, HashVerifyPolicy, ProgressCallback, ProgressInfo,
    ResultCallback, SpeedCallback, UncompletedSliceSavePolicy, VerboseCallback,
};

// HTTP module exports
pub use http::{TransferError, TransferPool, TransferRequest};
