//! Concurrency controller: pages through block metadata, drives a bounded set
//! of block fetches, reassembles them in index order into the sink, and
//! recovers from expired blocks, network drops and pauses.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::{BlockDescriptor, BlockFetcher, BlockSource, BoxByteStream, Page, PageRequest};
use crate::config::PipelineConfig;
use crate::controls::{DownloadCallbacks, PipelineState};
use crate::error::{TransferError, TransferResult};
use crate::reorder::ReorderBuffer;
use crate::sink::OutputSink;
use crate::trace::{trace_log, TraceWriter};
use crate::transform::{BlockTransform, Transformed};

// ---------------------------------------------------------------------------
// State shared between the controller and the controls facade
// ---------------------------------------------------------------------------

pub(crate) struct SharedInner {
    pub state: PipelineState,
    pub paused: bool,
    pub aborted: bool,
    pub cancel: CancellationToken,
    pub buffer: ReorderBuffer,
}

/// Everything the facade and the controller both touch. The reorder buffer is
/// only mutated by the controller; the facade reads it to know when a pause
/// has settled. Every mutation wakes [`PipelineShared::wait_until`] callers.
pub(crate) struct PipelineShared {
    inner: Mutex<SharedInner>,
    changed: Notify,
}

impl PipelineShared {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                state: PipelineState::Idle,
                paused: false,
                aborted: false,
                cancel: CancellationToken::new(),
                buffer: ReorderBuffer::new(),
            }),
            changed: Notify::new(),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&SharedInner) -> T) -> T {
        f(&self.inner.lock())
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut SharedInner) -> T) -> T {
        let out = f(&mut self.inner.lock());
        self.changed.notify_waiters();
        out
    }

    /// Suspend until `predicate` holds. Re-evaluated after every update.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&SharedInner) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.read(&mut predicate) {
                return;
            }
            notified.await;
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.read(|s| s.cancel.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.read(|s| s.paused)
    }

    pub fn is_aborted(&self) -> bool {
        self.read(|s| s.aborted)
    }

    pub fn state(&self) -> PipelineState {
        self.read(|s| s.state)
    }

    /// Hand out a fresh token for the next attempt unless the transfer is
    /// paused or aborted, in which case the current (cancelled) one stays.
    pub fn renew_token(&self) -> CancellationToken {
        self.update(|s| {
            if !s.paused && !s.aborted && s.cancel.is_cancelled() {
                s.cancel = CancellationToken::new();
            }
            s.cancel.clone()
        })
    }
}

// ---------------------------------------------------------------------------
// Retry budget for expired blocks
// ---------------------------------------------------------------------------

/// Counts consecutive expired-block retries. Retries closer together than
/// `window` accumulate; a longer gap starts the count over at 1.
#[derive(Debug)]
pub(crate) struct RetryBudget {
    count: u32,
    last_retry: Option<Instant>,
    max: u32,
    window: std::time::Duration,
}

impl RetryBudget {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            count: 0,
            last_retry: None,
            max: config.max_retries,
            window: config.retry_reset_window,
        }
    }

    /// Record a retry at `now`, returning its number, or `None` once the
    /// budget is spent.
    pub fn next(&mut self, now: Instant) -> Option<u32> {
        if self.count >= self.max {
            return None;
        }
        let within_window = self
            .last_retry
            .is_some_and(|last| now.duration_since(last) < self.window);
        self.count = if within_window { self.count + 1 } else { 1 };
        self.last_retry = Some(now);
        Some(self.count)
    }

    /// A new page or a restart after pause/network loss starts from zero.
    /// The timestamp of the last retry is kept.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub(crate) struct Controller {
    pub source: Arc<dyn BlockSource>,
    pub fetcher: Arc<dyn BlockFetcher>,
    pub transform: Arc<dyn BlockTransform>,
    pub callbacks: DownloadCallbacks,
    pub config: PipelineConfig,
    pub shared: Arc<PipelineShared>,
    pub sink: Arc<OutputSink>,
    pub trace: Option<Arc<TraceWriter>>,
    pub retries: RetryBudget,
}

impl Controller {
    /// Run the transfer to completion and close the sink.
    pub async fn run(mut self) -> TransferResult<()> {
        loop {
            let cancel = self.shared.cancel_token();
            let checked = tokio::select! {
                checked = self.transform.check_object_signature(&cancel) => checked,
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
            };
            match checked {
                Ok(()) => break,
                Err(e) if self.was_interrupted(&e, &cancel) => self.wait_resumed().await?,
                Err(e) => return Err(e),
            }
        }

        if let Some(total) = self.source.size_hint() {
            self.callbacks.init(total);
        }

        let request = PageRequest {
            from_index: 1,
            page_size: self.config.page_size,
        };
        let first = self.fetch_page(request).await?;
        if matches!(first, Page::Raw(_)) {
            self.write_raw_pages(request, first).await?;
        } else {
            self.download_pages(request, first).await?;
        }

        // Losing the close to cancel() turns success into cancellation.
        if !self.sink.close() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Fetch one metadata page. A page request cut short by a pause is
    /// repeated once the transfer is resumed.
    async fn fetch_page(&self, request: PageRequest) -> TransferResult<Page> {
        loop {
            let cancel = self.shared.cancel_token();
            let fetched = tokio::select! {
                page = self.source.fetch_page(&cancel, request) => page,
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
            };
            match fetched {
                Ok(page) => {
                    trace_log(&self.trace, || json!({
                        "event": "page",
                        "from_index": request.from_index,
                        "blocks": page.len(),
                    }));
                    return Ok(page);
                }
                Err(e) if self.was_interrupted(&e, &cancel) => {
                    debug!(from_index = request.from_index, "page request interrupted");
                    self.wait_resumed().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download every block page, starting with `page`. A short page is
    /// the last one.
    async fn download_pages(&self, mut request: PageRequest, mut page: Page) -> TransferResult<()> {
        loop {
            let more = page.has_more(request.page_size);
            let Page::Blocks(blocks) = page else {
                return Err(TransferError::UnexpectedData(
                    "raw bytes returned where block descriptors were expected".into(),
                ));
            };
            self.download_page(request, blocks).await?;
            if !more {
                return Ok(());
            }
            request = request.next();
            page = self.fetch_page(request).await?;
        }
    }

    /// Pre-resolved objects: write every page straight to the sink.
    async fn write_raw_pages(&self, mut request: PageRequest, mut page: Page) -> TransferResult<()> {
        loop {
            let more = page.has_more(request.page_size);
            let Page::Raw(chunks) = page else {
                return Err(TransferError::UnexpectedData(
                    "block descriptors returned where raw bytes were expected".into(),
                ));
            };
            for chunk in chunks {
                let len = chunk.len() as i64;
                self.sink.write(chunk).await?;
                self.callbacks.progress(len);
            }
            if !more {
                return Ok(());
            }
            request = request.next();
            page = self.fetch_page(request).await?;
        }
    }

    /// Drive up to `max_parallel_fetches` block downloads, flushing whenever
    /// the active block completes. The first error drops the whole set.
    async fn run_task_set(&self, cancel: &CancellationToken, queue: Vec<BlockDescriptor>) -> TransferResult<()> {
        let mut queue = queue.into_iter();
        let mut tasks = FuturesUnordered::new();
        let parallel = self.config.max_parallel_fetches;

        loop {
            while tasks.len() < parallel {
                let Some(block) = queue.next() else {
                    break;
                };
                tasks.push(self.download_block(cancel, block));
            }

            let Some(finished) = tasks.next().await else {
                return Ok(());
            };
            let index = finished?;
            if index == self.shared.read(|s| s.buffer.active_index()) {
                self.flush(cancel).await?;
            }
        }
    }

    /// Fetch one block into the reorder buffer. Returns the block index once
    /// the block is complete and verified.
    async fn download_block(&self, cancel: &CancellationToken, block: BlockDescriptor) -> TransferResult<u64> {
        let index = block.index;
        if self.shared.read(|s| s.buffer.is_done(index)) {
            return Ok(index);
        }

        self.claim_slot(cancel, index).await?;

        let t0 = Instant::now();
        trace_log(&self.trace, || json!({"event": "blk_start", "index": index}));

        let raw = tokio::select! {
            raw = self.fetcher.fetch_block(cancel, &block.locator) => raw?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        trace_log(&self.trace, || json!({
            "event": "blk_connected",
            "index": index,
            "latency_ms": t0.elapsed().as_secs_f64() * 1000.0,
        }));

        let raw = self.observe_progress(cancel.clone(), index, raw);
        let Transformed {
            mut stream,
            verification,
        } = self
            .transform
            .apply(cancel, raw, &block.encoded_signature)
            .await?;

        let mut chunks = 0u64;
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            let Some(piece) = next else {
                break;
            };
            let piece = piece?;
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            chunks += 1;
            self.shared.update(|s| s.buffer.push_chunk(index, piece));
        }

        self.transform.check_signature(cancel, verification).await?;
        self.shared.update(|s| s.buffer.mark_done(index));

        trace_log(&self.trace, || json!({
            "event": "blk_done",
            "index": index,
            "chunks": chunks,
            "elapsed_ms": t0.elapsed().as_secs_f64() * 1000.0,
        }));
        Ok(index)
    }

    /// Wait for room in the reorder buffer, then reserve an entry for
    /// `index`. Slots open up only when the active block is flushed.
    async fn claim_slot(&self, cancel: &CancellationToken, index: u64) -> TransferResult<()> {
        let window = self.config.max_downloading_blocks;
        let waiting = self
            .shared
            .wait_until(|s| s.buffer.has_slot_for(index, window) || s.cancel.is_cancelled());
        tokio::select! {
            _ = waiting => {}
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.shared.update(|s| s.buffer.reserve(index))
    }

    /// Count raw bytes as progress while they stream in.
    fn observe_progress(&self, cancel: CancellationToken, index: u64, raw: BoxByteStream) -> BoxByteStream {
        let shared = self.shared.clone();
        let callbacks = self.callbacks.clone();
        Box::pin(raw.map(move |piece| {
            let piece = piece?;
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            shared.update(|s| s.buffer.record_progress(index, piece.len() as u64));
            callbacks.progress(piece.len() as i64);
            Ok(piece)
        }))
    }

    /// Write every complete block at the head of the buffer to the sink.
    async fn flush(&self, cancel: &CancellationToken) -> TransferResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let Some((index, chunks)) = self.shared.update(|s| s.buffer.take_flushable()) else {
                return Ok(());
            };
            let mut bytes = 0u64;
            for chunk in chunks {
                bytes += chunk.len() as u64;
                self.sink.write(chunk).await?;
            }
            trace_log(&self.trace, || json!({
                "event": "flush",
                "index": index,
                "bytes": bytes,
            }));
        }
    }

    /// Retract progress for blocks that were still streaming and drop them.
    fn revert(&self, reason: &'static str) {
        let retracted = self.shared.update(|s| s.buffer.revert());
        if retracted > 0 {
            self.callbacks.progress(-(retracted as i64));
        }
        debug!(reason, bytes = retracted, "reverted progress");
        trace_log(&self.trace, || json!({
            "event": "revert",
            "reason": reason,
            "bytes": retracted,
        }));
    }

    /// A cancellation caused by `pause()` rather than by `cancel()` or by the
    /// reader going away. The attempt's token is cancelled in that case even
    /// if `resume()` has already run.
    fn was_interrupted(&self, err: &TransferError, cancel: &CancellationToken) -> bool {
        err.is_cancelled() && cancel.is_cancelled() && !self.shared.is_aborted()
    }

    async fn wait_resumed(&self) -> TransferResult<()> {
        if self.shared.is_paused() {
            info!("transfer paused");
        }
        self.shared.wait_until(|s| !s.paused || s.aborted).await;
        if self.shared.is_aborted() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }
}
