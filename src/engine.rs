//! Download engine
//!
//! [`Downloader`] is the caller-facing facade; behind it one worker task
//! runs the coordinator loop: probe, build-or-resume the slice layout,
//! schedule slice transfers on the pool, drain transfer events, flush
//! durable state on a cadence, and finalize. All slice mutation happens on
//! that one task; `pause`/`resume`/`stop` only flip atomics observed at the
//! loop's suspension points.

use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult, Result};
use crate::event::{EventFlag, StopToken, Stopwatch};
use crate::http::{self, probe, TransferError, TransferEvent, TransferPool};
use crate::manager::SliceManager;
use crate::observer::{ProgressReporter, SpeedReporter};
use crate::slice::SliceStatus;
use crate::types::{DownloadState, ProgressCallback, ResultCallback, SpeedCallback};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often durable state (slice buffers, then the index) is flushed.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Poll quantum on the transfer event channel when it is idle.
const POLL_QUANTUM: Duration = Duration::from_millis(100);

/// Granularity of the paused-state wait against the stop flag.
const PAUSE_WAIT: Duration = Duration::from_millis(50);

/// Resumable multi-slice downloader.
///
/// One `Downloader` drives one run at a time; `start` while a run is active
/// fails with `AlreadyDownloading`. The configuration is taken by value and
/// frozen for the duration of a run.
pub struct Downloader {
    cfg: DownloadConfig,
    state: Arc<StateCell>,
    paused: Arc<AtomicBool>,
    internal_stop: Arc<EventFlag>,
    origin_size: Arc<Mutex<Option<u64>>>,
}

/// Awaitable handle for a running download; resolves to the terminal code.
#[derive(Debug)]
pub struct DownloadHandle {
    inner: JoinHandle<DownloadResult>,
}

impl Future for DownloadHandle {
    type Output = DownloadResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|r| r.unwrap_or(DownloadResult::UnknownError))
    }
}

impl Downloader {
    pub fn new(cfg: DownloadConfig) -> Self {
        Self {
            cfg,
            state: Arc::new(StateCell::new()),
            paused: Arc::new(AtomicBool::new(false)),
            internal_stop: Arc::new(EventFlag::new()),
            origin_size: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.cfg
    }

    /// Begin a download run.
    ///
    /// Option violations are reported synchronously; everything after that
    /// arrives through the returned handle and the result callback, which
    /// fires exactly once per run.
    pub fn start(
        &self,
        url: impl Into<String>,
        target_path: impl Into<PathBuf>,
        result_cb: Option<ResultCallback>,
        progress_cb: Option<ProgressCallback>,
        speed_cb: Option<SpeedCallback>,
    ) -> Result<DownloadHandle> {
        if self.state() != DownloadState::Stopped {
            return Err(DownloadError::invalid_option(
                "state",
                DownloadResult::AlreadyDownloading,
                "a run is already in progress",
            ));
        }

        let url = url.into();
        let parsed = url::Url::parse(&url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_option(
                "url",
                DownloadResult::InvalidUrl,
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }

        let target_path: PathBuf = target_path.into();
        if target_path.as_os_str().is_empty() {
            return Err(DownloadError::invalid_option(
                "target_file_path",
                DownloadResult::InvalidTargetFilePath,
                "path is empty",
            ));
        }
        if let Some(parent) = target_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DownloadError::invalid_option(
                        "target_file_path",
                        DownloadResult::InvalidTargetFilePath,
                        format!("cannot create parent directory: {e}"),
                    )
                })?;
            }
        }

        self.cfg.validate()?;

        self.internal_stop.unset();
        self.paused.store(false, Ordering::SeqCst);
        self.state.store(DownloadState::Downloading);
        *self.origin_size.lock() = None;

        let ctx = RunContext {
            cfg: Arc::new(self.cfg.clone()),
            url,
            target_path,
            paused: Arc::clone(&self.paused),
            stop: StopToken {
                internal: Arc::clone(&self.internal_stop),
                user: self.cfg.user_stop_event.clone(),
            },
            origin_size: Arc::clone(&self.origin_size),
            progress_cb,
            speed_cb,
        };
        let state = Arc::clone(&self.state);
        let internal_stop = Arc::clone(&self.internal_stop);

        let inner = tokio::spawn(async move {
            let code = run(ctx).await;
            state.store(DownloadState::Stopped);
            internal_stop.set();
            if let Some(cb) = result_cb {
                cb(code);
            }
            code
        });
        Ok(DownloadHandle { inner })
    }

    /// Pause the active run; in-flight transfers stall, nothing new starts.
    pub fn pause(&self) {
        if self.state() == DownloadState::Downloading {
            self.paused.store(true, Ordering::SeqCst);
            self.state.store(DownloadState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.state() == DownloadState::Paused {
            self.paused.store(false, Ordering::SeqCst);
            self.state.store(DownloadState::Downloading);
        }
    }

    /// Request cooperative cancellation. The run observes the flag at its
    /// next suspension point, finalizes, and reports `Canceled`.
    pub fn stop(&self) {
        self.internal_stop.set();
    }

    pub fn state(&self) -> DownloadState {
        self.state.load()
    }

    /// Probed size of the resource, once a run has learned it.
    pub fn origin_file_size(&self) -> Option<u64> {
        *self.origin_size.lock()
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new(DownloadConfig::default())
    }
}

/// Everything the coordinator task needs, detached from the facade.
struct RunContext {
    cfg: Arc<DownloadConfig>,
    url: String,
    target_path: PathBuf,
    paused: Arc<AtomicBool>,
    stop: StopToken,
    origin_size: Arc<Mutex<Option<u64>>>,
    progress_cb: Option<ProgressCallback>,
    speed_cb: Option<SpeedCallback>,
}

async fn run(ctx: RunContext) -> DownloadResult {
    match run_inner(&ctx).await {
        Ok(()) => {
            ctx.cfg.emit_verbose("download finished successfully");
            DownloadResult::Success
        }
        Err(e) => {
            // A requested stop overrides whatever failure it provoked.
            let code = if ctx.stop.is_stopped() {
                DownloadResult::Canceled
            } else {
                e.code()
            };
            tracing::debug!(error = %e, code = %code, "download run ended");
            ctx.cfg.emit_verbose(&format!("download ended: {e}"));
            code
        }
    }
}

async fn run_inner(ctx: &RunContext) -> Result<()> {
    let cfg = &ctx.cfg;
    tracing::debug!(url = %ctx.url, target = %ctx.target_path.display(), "starting download");
    cfg.emit_verbose(&format!("url: {}", ctx.url));
    cfg.emit_verbose(&format!("target: {}", ctx.target_path.display()));

    let client = http::build_client(cfg)?;

    let info = probe::fetch_with_retry(&client, cfg, &ctx.url, &ctx.stop).await?;
    cfg.emit_verbose(&format!(
        "probe: size={:?} accept_ranges={} md5={:?}",
        info.file_size, info.accept_ranges, info.content_md5
    ));

    // An empty remote resource needs no slices and no index.
    if info.file_size == Some(0) {
        tokio::fs::write(&ctx.target_path, b"").await.map_err(|e| {
            DownloadError::storage(
                DownloadResult::CreateTargetFileFailed,
                &ctx.target_path,
                format!("create empty target failed: {e}"),
            )
        })?;
        return Ok(());
    }

    let final_url = match &info.redirect_url {
        Some(redirected) => {
            url::Url::parse(redirected).map_err(|e| {
                DownloadError::invalid_option(
                    "redirect_url",
                    DownloadResult::InvalidRedirectedUrl,
                    e.to_string(),
                )
            })?;
            cfg.emit_verbose(&format!("redirected to: {redirected}"));
            redirected.clone()
        }
        None => ctx.url.clone(),
    };

    let manager = Arc::new(SliceManager::new(
        Arc::clone(cfg),
        final_url,
        ctx.target_path.clone(),
        info.file_size,
        info.content_md5.clone(),
    ));

    match manager.load_exist_slices().await {
        Ok(()) => cfg.emit_verbose("resumed slice layout from index"),
        Err(e) => {
            tracing::debug!(error = %e, "index unusable, building a fresh layout");
            manager.make_slices(info.accept_ranges).await?;
        }
    }
    *ctx.origin_size.lock() = manager.origin_file_size();

    if manager.origin_file_size().is_some()
        && (manager.all_slices_completed() || manager.check_all_completed_by_file_size())
    {
        cfg.emit_verbose("all slices already downloaded");
        return manager.finish(ctx.stop.is_stopped()).await;
    }

    let thread_count = cfg.resolved_thread_count();
    let mut pool = TransferPool::new(client, thread_count as usize * 4);

    // Initial quotas split the cache and speed budget over the slices that
    // will actually run.
    let concurrency = thread_count.min(manager.unfinished_count()).max(1);
    let (cache_per_slice, speed_per_slice) = per_slice_quotas(cfg, concurrency);
    cfg.emit_verbose(&format!(
        "cache per slice: {cache_per_slice} bytes, speed per slice: {speed_per_slice:?}"
    ));

    let mut seeded = 0u32;
    while seeded < thread_count {
        let Some(index) = manager.first_with_status(SliceStatus::Unfetch) else {
            break;
        };
        let Some(request) = manager.prepare_start(index, cache_per_slice, speed_per_slice) else {
            break;
        };
        pool.add(request)?;
        cfg.emit_verbose(&format!("slice {index} started"));
        seeded += 1;
    }
    if seeded == 0 {
        return Err(DownloadError::Other("no slice could be scheduled".into()));
    }

    let progress_reporter = ctx
        .progress_cb
        .clone()
        .map(|cb| ProgressReporter::spawn(Arc::clone(&manager), cb));
    let speed_reporter = ctx
        .speed_cb
        .clone()
        .map(|cb| SpeedReporter::spawn(Arc::clone(&manager), cb));

    let loop_result = transfer_loop(ctx, &manager, &mut pool, thread_count).await;

    // Observers go away before the manager is finalized and dropped.
    drop(progress_reporter);
    drop(speed_reporter);
    pool.shutdown();

    let stop_requested = ctx.stop.is_stopped();
    match loop_result {
        Ok(()) => manager.finish(stop_requested).await,
        Err(e) => {
            if let Err(fin) = manager.finish(stop_requested).await {
                tracing::debug!(error = %fin, "finalization after loop failure");
            }
            Err(e)
        }
    }
}

/// The multiplexed poll/perform loop.
async fn transfer_loop(
    ctx: &RunContext,
    manager: &Arc<SliceManager>,
    pool: &mut TransferPool,
    thread_count: u32,
) -> Result<()> {
    let cfg = &ctx.cfg;
    let mut flush_meter = Stopwatch::start();

    loop {
        while ctx.paused.load(Ordering::SeqCst) {
            if ctx.stop.wait(PAUSE_WAIT).await {
                break;
            }
        }
        if ctx.stop.is_stopped() {
            break;
        }

        if flush_meter.elapsed() >= FLUSH_INTERVAL {
            manager.flush_all_slices().await?;
            manager.flush_index_file().await?;
            flush_meter.restart();
        }

        match pool.next_event(POLL_QUANTUM).await {
            Some(TransferEvent::Chunk { slice, data }) => {
                manager.write_slice_data(slice, &data).await?;
            }
            Some(TransferEvent::Done { slice, result }) => {
                pool.remove(slice);
                manager.flush_slice(slice).await?;
                apply_done_transition(cfg, manager, slice, result);
                manager.flush_index_file().await?;
            }
            None => {}
        }

        if (pool.active() as u32) < thread_count {
            replenish(cfg, manager, pool)?;
        }

        if pool.active() == 0 && !ctx.paused.load(Ordering::SeqCst) {
            break;
        }
    }
    Ok(())
}

/// Demuxed completion handling for one slice (§transfer state machine).
fn apply_done_transition(
    cfg: &DownloadConfig,
    manager: &SliceManager,
    slice: usize,
    result: std::result::Result<(), TransferError>,
) {
    let Some(snap) = manager.snapshot(slice) else {
        return;
    };
    match result {
        Ok(()) => {
            let capacity = snap.end.map(|end| end - snap.begin + 1);
            if capacity.is_some() && capacity == Some(snap.received) {
                cfg.emit_verbose(&format!("slice {slice} completed"));
                manager.set_status(slice, SliceStatus::Completed);
            } else if snap.end.is_none() {
                // Open-ended slice: a clean end is only provisional until
                // the aggregate size is reconciled.
                manager.set_status(slice, SliceStatus::CompletedNotSure);
            } else {
                cfg.emit_verbose(&format!(
                    "slice {slice} ended short ({} of {:?} bytes)",
                    snap.received, capacity
                ));
                manager.note_failed(slice);
            }
        }
        Err(e) => {
            tracing::debug!(slice, error = %e, "slice transfer failed");
            cfg.emit_verbose(&format!("slice {slice} failed: {e}"));
            manager.note_failed(slice);
        }
    }
}

/// Keep the pool saturated: fresh slices first, then retryable failures,
/// then reconcile an open-ended slice once nothing else is running.
fn replenish(cfg: &DownloadConfig, manager: &SliceManager, pool: &mut TransferPool) -> Result<()> {
    if let Some(index) = manager.first_with_status(SliceStatus::Unfetch) {
        cfg.emit_verbose(&format!("slice {index} started"));
        return start_slice(cfg, manager, pool, index);
    }
    if let Some(index) = manager.first_retryable_failed() {
        cfg.emit_verbose(&format!("retrying slice {index}"));
        return start_slice(cfg, manager, pool, index);
    }
    if pool.active() == 0 && manager.first_with_status(SliceStatus::Downloading).is_none() {
        if let Some(index) = manager.first_with_status(SliceStatus::CompletedNotSure) {
            if manager.origin_file_size().is_none() || manager.check_all_completed_by_file_size() {
                manager.set_status(index, SliceStatus::Completed);
            } else {
                cfg.emit_verbose(&format!("slice {index} is short, re-downloading"));
                return start_slice(cfg, manager, pool, index);
            }
        }
    }
    Ok(())
}

fn start_slice(
    cfg: &DownloadConfig,
    manager: &SliceManager,
    pool: &mut TransferPool,
    index: usize,
) -> Result<()> {
    let (cache, speed) = per_slice_quotas(cfg, pool.active() as u32 + 1);
    let Some(request) = manager.prepare_start(index, cache, speed) else {
        return Ok(());
    };
    pool.add(request)
}

/// Split the cache and speed budgets over `n` concurrent slices.
fn per_slice_quotas(cfg: &DownloadConfig, n: u32) -> (usize, Option<u64>) {
    let n = n.max(1) as u64;
    let cache = (cfg.disk_cache_size / n).max(1) as usize;
    let speed = cfg.max_speed.map(|s| (s / n).max(1));
    (cache, speed)
}

/// Atomic cell for [`DownloadState`].
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    fn store(&self, state: DownloadState) {
        let v = match state {
            DownloadState::Stopped => 0,
            DownloadState::Downloading => 1,
            DownloadState::Paused => 2,
        };
        self.0.store(v, Ordering::SeqCst);
    }

    fn load(&self) -> DownloadState {
        match self.0.load(Ordering::SeqCst) {
            1 => DownloadState::Downloading,
            2 => DownloadState::Paused,
            _ => DownloadState::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_slice_quotas() {
        let cfg = DownloadConfig {
            disk_cache_size: 100,
            max_speed: Some(900),
            ..Default::default()
        };
        assert_eq!(per_slice_quotas(&cfg, 3), (33, Some(300)));
        assert_eq!(per_slice_quotas(&cfg, 0), (100, Some(900)));

        let unlimited = DownloadConfig {
            disk_cache_size: 100,
            max_speed: None,
            ..Default::default()
        };
        assert_eq!(per_slice_quotas(&unlimited, 4), (25, None));
    }

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), DownloadState::Stopped);
        cell.store(DownloadState::Downloading);
        assert_eq!(cell.load(), DownloadState::Downloading);
        cell.store(DownloadState::Paused);
        assert_eq!(cell.load(), DownloadState::Paused);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_url() {
        let dl = Downloader::default();
        let err = dl
            .start("not a url", "/tmp/x.bin", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidUrl);

        let err = dl
            .start("ftp://example.com/f", "/tmp/x.bin", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidUrl);
    }

    #[tokio::test]
    async fn test_start_rejects_empty_target() {
        let dl = Downloader::default();
        let err = dl
            .start("http://example.com/f", "", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidTargetFilePath);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_config() {
        let cfg = DownloadConfig {
            thread_count: 1000,
            ..Default::default()
        };
        let dl = Downloader::new(cfg);
        let err = dl
            .start("http://example.com/f", "/tmp/x.bin", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidThreadNum);
    }
}
