use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use blockdl::block::{BlockDescriptor, BlockFetcher, BlockLocator, BlockSource, BoxByteStream, Page, PageRequest};
use blockdl::config::PipelineConfig;
use blockdl::controls::{DownloadCallbacks, DownloadControls, PipelineState};
use blockdl::error::TransferError;
use blockdl::memory::InlineSource;
use blockdl::sink::BlockStream;
use blockdl::transform::{sha256_hex, Sha256Transform};

// ---------------------------------------------------------------------------
// Scripted source and fetcher
// ---------------------------------------------------------------------------

struct MockSource {
    blocks: Vec<BlockDescriptor>,
    size: u64,
    page_requests: AtomicUsize,
    raw_after_first_page: bool,
}

impl MockSource {
    fn new(data: &[Bytes], signatures: &[String]) -> Self {
        let blocks = (1..=data.len() as u64)
            .map(|index| BlockDescriptor {
                index,
                locator: BlockLocator::Url {
                    url: format!("mem://block/{index}"),
                    token: None,
                },
                encoded_signature: signatures
                    .get(index as usize - 1)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        Self {
            blocks,
            size: data.iter().map(|b| b.len() as u64).sum(),
            page_requests: AtomicUsize::new(0),
            raw_after_first_page: false,
        }
    }

    fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockSource for MockSource {
    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn fetch_page(&self, _: &CancellationToken, request: PageRequest) -> Result<Page, TransferError> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        if self.raw_after_first_page && request.from_index > 1 {
            return Ok(Page::Raw(vec![Bytes::from_static(b"stray")]));
        }
        Ok(Page::Blocks(
            self.blocks
                .iter()
                .filter(|b| b.index >= request.from_index)
                .take(request.page_size)
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// The block URL has expired.
    Expire,
    /// The connection drops after the first half of the block.
    DropAfterFirstChunk,
    /// The first half arrives, then nothing until the fetch is cancelled.
    StallAfterFirstChunk,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockFetcher {
    data: HashMap<u64, Bytes>,
    delays: HashMap<u64, Duration>,
    faults: Mutex<HashMap<u64, VecDeque<Fault>>>,
    fetches: Mutex<HashMap<u64, usize>>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
    stalled: Arc<Notify>,
}

impl MockFetcher {
    fn new(data: &[Bytes]) -> Self {
        Self {
            data: (1..).zip(data.iter().cloned()).collect(),
            ..Self::default()
        }
    }

    fn delay(mut self, index: u64, ms: u64) -> Self {
        self.delays.insert(index, Duration::from_millis(ms));
        self
    }

    fn fault(self, index: u64, fault: Fault) -> Self {
        self.faults.lock().entry(index).or_default().push_back(fault);
        self
    }

    fn fetches(&self, index: u64) -> usize {
        self.fetches.lock().get(&index).copied().unwrap_or_default()
    }
}

#[async_trait]
impl BlockFetcher for MockFetcher {
    async fn fetch_block(&self, _: &CancellationToken, locator: &BlockLocator) -> Result<BoxByteStream, TransferError> {
        let BlockLocator::Url { url, .. } = locator else {
            return Err(TransferError::UnexpectedData("range locator".into()));
        };
        let index: u64 = url
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransferError::UnexpectedData(url.clone()))?;
        *self.fetches.lock().entry(index).or_default() += 1;

        let fault = self.faults.lock().get_mut(&index).and_then(VecDeque::pop_front);
        if let Some(Fault::Expire) = fault {
            return Err(TransferError::ExpiredBlock(format!("block {index} expired")));
        }

        let body = self.data.get(&index).cloned().unwrap_or_default();
        let mid = body.len() / 2;
        let chunks: Vec<Bytes> = [body.slice(..mid), body.slice(mid..)]
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect();
        let delay = self.delays.get(&index).copied();
        let stalled = self.stalled.clone();

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        Ok(Box::pin(stream! {
            let _guard = guard;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            for (i, chunk) in chunks.into_iter().enumerate() {
                if i == 1 {
                    match fault {
                        Some(Fault::DropAfterFirstChunk) => {
                            yield Err(TransferError::Network("connection reset".into()));
                            break;
                        }
                        Some(Fault::StallAfterFirstChunk) => {
                            stalled.notify_one();
                            std::future::pending::<()>().await;
                        }
                        _ => {}
                    }
                }
                yield Ok(chunk);
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    progress: AtomicI64,
    inits: Mutex<Vec<u64>>,
    network_errors: AtomicUsize,
    errors: Mutex<Vec<TransferError>>,
    finishes: AtomicUsize,
}

impl Recorder {
    fn callbacks(self: &Arc<Self>) -> DownloadCallbacks {
        let (p, i, e, f) = (self.clone(), self.clone(), self.clone(), self.clone());
        DownloadCallbacks::new()
            .on_progress(move |delta| {
                p.progress.fetch_add(delta, Ordering::SeqCst);
            })
            .on_init(move |total| i.inits.lock().push(total))
            .on_error(move |err| e.errors.lock().push(err.clone()))
            .on_finish(move || {
                f.finishes.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn progress(&self) -> i64 {
        self.progress.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn blocks(n: u64) -> Vec<Bytes> {
    (1..=n)
        .map(|i| Bytes::from(format!("<block {i}>").repeat(i as usize * 3 + 5)))
        .collect()
}

fn joined(data: &[Bytes]) -> Vec<u8> {
    data.concat()
}

fn total(data: &[Bytes]) -> i64 {
    data.iter().map(|b| b.len() as i64).sum()
}

fn config(max_downloading_blocks: usize, max_parallel_fetches: usize, page_size: usize) -> PipelineConfig {
    PipelineConfig {
        max_downloading_blocks,
        max_parallel_fetches,
        page_size,
        ..PipelineConfig::default()
    }
}

async fn collect(mut stream: BlockStream) -> Result<Vec<u8>, TransferError> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn output_is_in_index_order_when_blocks_finish_backwards() {
    let data = blocks(3);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = MockFetcher::new(&data).delay(1, 60).delay(2, 30);
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source.clone(), Arc::new(fetcher))
        .config(config(10, 5, 50))
        .callbacks(rec.callbacks())
        .build()
        .unwrap();
    assert_eq!(controls.state(), PipelineState::Idle);

    let out = collect(controls.start().unwrap()).await.unwrap();
    assert_eq!(out, joined(&data));

    eventually(|| rec.finishes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(controls.state(), PipelineState::Finished);
    assert_eq!(*rec.inits.lock(), vec![total(&data) as u64]);
    assert_eq!(rec.progress(), total(&data));
    assert!(rec.errors.lock().is_empty());
    assert_eq!(source.page_requests(), 1);
}

#[tokio::test]
async fn blocks_span_several_pages() {
    let data = blocks(7);
    let source = Arc::new(MockSource::new(&data, &[]));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source.clone(), Arc::new(MockFetcher::new(&data)))
        .config(config(4, 2, 3))
        .callbacks(rec.callbacks())
        .build()
        .unwrap();

    let out = collect(controls.start().unwrap()).await.unwrap();
    assert_eq!(out, joined(&data));
    // Pages of 3, 3 and 1 blocks; the short page ends the listing.
    assert_eq!(source.page_requests(), 3);
    assert_eq!(rec.progress(), total(&data));
}

#[tokio::test]
async fn empty_trailing_page_ends_the_transfer() {
    let data = blocks(4);
    let source = Arc::new(MockSource::new(&data, &[]));

    let controls = DownloadControls::builder(source.clone(), Arc::new(MockFetcher::new(&data)))
        .config(config(10, 5, 2))
        .build()
        .unwrap();

    assert_eq!(collect(controls.start().unwrap()).await.unwrap(), joined(&data));
    assert_eq!(source.page_requests(), 3);
}

#[tokio::test]
async fn zero_length_block_completes() {
    let mut data = blocks(3);
    data[1] = Bytes::new();
    let source = Arc::new(MockSource::new(&data, &[]));

    let controls = DownloadControls::builder(source, Arc::new(MockFetcher::new(&data)))
        .build()
        .unwrap();

    assert_eq!(collect(controls.start().unwrap()).await.unwrap(), joined(&data));
}

#[tokio::test]
async fn expired_block_refreshes_the_page_once() {
    let data = blocks(4);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data).delay(1, 20).fault(2, Fault::Expire));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source.clone(), fetcher.clone())
        .config(config(10, 5, 50))
        .callbacks(rec.callbacks())
        .build()
        .unwrap();

    let out = collect(controls.start().unwrap()).await.unwrap();
    assert_eq!(out, joined(&data));
    assert_eq!(source.page_requests(), 2);
    assert_eq!(fetcher.fetches(2), 2);
    assert_eq!(rec.progress(), total(&data));
    eventually(|| rec.finishes.load(Ordering::SeqCst) == 1).await;
    assert!(rec.errors.lock().is_empty());
}

#[tokio::test]
async fn persistent_expiry_gives_up_after_max_retries() {
    let data = blocks(2);
    let source = Arc::new(MockSource::new(&data, &[]));
    let mut fetcher = MockFetcher::new(&data);
    for _ in 0..10 {
        fetcher = fetcher.fault(1, Fault::Expire);
    }
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source.clone(), Arc::new(fetcher))
        .config(PipelineConfig {
            max_retries: 2,
            ..config(10, 5, 50)
        })
        .callbacks(rec.callbacks())
        .build()
        .unwrap();

    let err = collect(controls.start().unwrap()).await.unwrap_err();
    assert!(err.is_expired(), "{err}");
    // The first listing plus one refresh per retry.
    assert_eq!(source.page_requests(), 3);

    eventually(|| rec.errors.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(rec.errors.lock().len(), 1);
    assert_eq!(controls.state(), PipelineState::Errored);
    assert_eq!(rec.finishes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reorder_window_bounds_concurrent_fetches() {
    let data = blocks(5);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(
        MockFetcher::new(&data)
            .delay(1, 40)
            .delay(2, 10)
            .delay(3, 10)
            .delay(4, 10),
    );

    let controls = DownloadControls::builder(source, fetcher.clone())
        .config(config(2, 5, 50))
        .build()
        .unwrap();

    assert_eq!(collect(controls.start().unwrap()).await.unwrap(), joined(&data));
    assert!(fetcher.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn network_drop_is_resumed_from_the_callback() {
    let data = blocks(3);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data).fault(2, Fault::DropAfterFirstChunk));
    let rec = Arc::new(Recorder::default());

    let handle: Arc<OnceLock<Weak<DownloadControls>>> = Arc::new(OnceLock::new());
    let (cell, seen) = (handle.clone(), rec.clone());
    let callbacks = rec.callbacks().on_network_error(move |err| {
        assert!(err.is_network());
        seen.network_errors.fetch_add(1, Ordering::SeqCst);
        if let Some(controls) = cell.get().and_then(Weak::upgrade) {
            controls.resume();
        }
    });

    let controls = Arc::new(
        DownloadControls::builder(source, fetcher.clone())
            .callbacks(callbacks)
            .build()
            .unwrap(),
    );
    let _ = handle.set(Arc::downgrade(&controls));

    let out = collect(controls.start().unwrap()).await.unwrap();
    assert_eq!(out, joined(&data));
    assert_eq!(rec.network_errors.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.fetches(2), 2);
    // Bytes of the dropped attempt were retracted.
    assert_eq!(rec.progress(), total(&data));
    eventually(|| controls.state() == PipelineState::Finished).await;
}

#[tokio::test]
async fn network_drop_without_handler_is_fatal() {
    let data = blocks(2);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = MockFetcher::new(&data).fault(1, Fault::DropAfterFirstChunk);
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, Arc::new(fetcher))
        .callbacks(rec.callbacks())
        .build()
        .unwrap();

    let err = collect(controls.start().unwrap()).await.unwrap_err();
    assert!(err.is_network(), "{err}");
    eventually(|| rec.errors.lock().len() == 1).await;
    assert_eq!(controls.state(), PipelineState::Errored);
}

#[tokio::test]
async fn pause_retracts_partial_block_and_resume_refetches_it() {
    let data = blocks(4);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data).fault(2, Fault::StallAfterFirstChunk));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, fetcher.clone())
        .callbacks(rec.callbacks())
        .build()
        .unwrap();
    let reader = tokio::spawn(collect(controls.start().unwrap()));

    fetcher.stalled.notified().await;
    controls.pause().await;
    assert_eq!(controls.state(), PipelineState::Paused);
    assert!(controls.is_paused());

    let paused_at = rec.progress();
    assert!(paused_at <= total(&data) - data[1].len() as i64);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rec.progress(), paused_at);

    controls.resume();
    assert_eq!(controls.state(), PipelineState::Running);

    let out = reader.await.unwrap().unwrap();
    assert_eq!(out, joined(&data));
    assert_eq!(fetcher.fetches(2), 2);
    assert_eq!(rec.progress(), total(&data));
    eventually(|| rec.finishes.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn paused_before_start_waits_for_resume() {
    let data = blocks(3);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, fetcher.clone())
        .callbacks(rec.callbacks())
        .build()
        .unwrap();
    controls.pause().await;
    let reader = tokio::spawn(collect(controls.start().unwrap()));
    assert_eq!(controls.state(), PipelineState::Paused);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.fetches(1), 0);
    assert_eq!(rec.progress(), 0);

    controls.resume();
    assert_eq!(reader.await.unwrap().unwrap(), joined(&data));
}

#[tokio::test]
async fn cancel_fails_the_reader_and_reports_once() {
    let data = blocks(3);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data).fault(1, Fault::StallAfterFirstChunk));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, fetcher.clone())
        .callbacks(rec.callbacks())
        .build()
        .unwrap();
    let mut stream = controls.start().unwrap();

    fetcher.stalled.notified().await;
    controls.cancel();
    controls.cancel();

    assert!(matches!(stream.next().await, Some(Err(TransferError::Cancelled))));
    assert!(stream.next().await.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*rec.errors.lock(), vec![TransferError::Cancelled]);
    assert_eq!(controls.state(), PipelineState::Aborted);
    assert_eq!(rec.finishes.load(Ordering::SeqCst), 0);

    // Stopped transfers ignore further control calls.
    controls.pause().await;
    controls.resume();
    assert_eq!(controls.state(), PipelineState::Aborted);
}

#[tokio::test]
async fn verified_blocks_pass_digest_checks() {
    let data = blocks(3);
    let digests: Vec<String> = data.iter().map(|b| sha256_hex(b)).collect();
    let source = Arc::new(MockSource::new(&data, &digests));

    let controls = DownloadControls::builder(source, Arc::new(MockFetcher::new(&data)))
        .transform(Arc::new(Sha256Transform::new()))
        .build()
        .unwrap();

    assert_eq!(collect(controls.start().unwrap()).await.unwrap(), joined(&data));
}

#[tokio::test]
async fn digest_mismatch_is_an_integrity_error() {
    let data = blocks(3);
    let mut digests: Vec<String> = data.iter().map(|b| sha256_hex(b)).collect();
    digests[1] = sha256_hex(b"something else");
    let source = Arc::new(MockSource::new(&data, &digests));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, Arc::new(MockFetcher::new(&data)))
        .transform(Arc::new(Sha256Transform::new()))
        .callbacks(rec.callbacks())
        .build()
        .unwrap();

    let err = collect(controls.start().unwrap()).await.unwrap_err();
    assert!(matches!(err, TransferError::Integrity(_)), "{err}");
    eventually(|| rec.errors.lock().len() == 1).await;
    assert_eq!(controls.state(), PipelineState::Errored);
}

#[tokio::test]
async fn etag_mismatch_fails_before_any_fetch() {
    let data = blocks(2);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data));
    let transform = Sha256Transform::new().with_etag_check(Some("abc".into()), Some("def".into()));

    let controls = DownloadControls::builder(source.clone(), fetcher.clone())
        .transform(Arc::new(transform))
        .build()
        .unwrap();

    let err = collect(controls.start().unwrap()).await.unwrap_err();
    assert!(matches!(err, TransferError::Integrity(_)), "{err}");
    assert_eq!(source.page_requests(), 0);
    assert_eq!(fetcher.fetches(1), 0);
}

#[tokio::test]
async fn raw_pages_are_written_directly() {
    let chunks: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("raw-{i};"))).collect();
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(
        Arc::new(InlineSource::new(chunks.clone())),
        Arc::new(MockFetcher::default()),
    )
    .config(config(10, 5, 2))
    .callbacks(rec.callbacks())
    .build()
    .unwrap();

    assert_eq!(collect(controls.start().unwrap()).await.unwrap(), joined(&chunks));
    assert_eq!(*rec.inits.lock(), vec![total(&chunks) as u64]);
    assert_eq!(rec.progress(), total(&chunks));
}

#[tokio::test]
async fn raw_page_after_block_page_is_unexpected() {
    let data = blocks(4);
    let mut source = MockSource::new(&data, &[]);
    source.raw_after_first_page = true;

    let controls = DownloadControls::builder(Arc::new(source), Arc::new(MockFetcher::new(&data)))
        .config(config(10, 5, 2))
        .build()
        .unwrap();

    let err = collect(controls.start().unwrap()).await.unwrap_err();
    assert!(matches!(err, TransferError::UnexpectedData(_)), "{err}");
}

#[tokio::test]
async fn dropped_reader_stops_the_transfer() {
    let data = blocks(3);
    let source = Arc::new(MockSource::new(&data, &[]));
    let fetcher = Arc::new(MockFetcher::new(&data).delay(1, 30));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, fetcher)
        .callbacks(rec.callbacks())
        .build()
        .unwrap();
    drop(controls.start().unwrap());

    eventually(|| controls.state() == PipelineState::Errored).await;
    assert_eq!(*rec.errors.lock(), vec![TransferError::Cancelled]);
}

#[tokio::test]
async fn zero_pipeline_knobs_are_rejected_before_start() {
    let data = blocks(2);
    for zeroed in [config(0, 5, 50), config(10, 0, 50), config(10, 5, 0)] {
        let source = Arc::new(MockSource::new(&data, &[]));
        let built = DownloadControls::builder(source.clone(), Arc::new(MockFetcher::new(&data)))
            .config(zeroed)
            .build();
        assert!(matches!(built, Err(TransferError::InvalidConfig(_))));
        assert_eq!(source.page_requests(), 0);
    }
}

#[tokio::test]
async fn cancel_after_end_of_stream_keeps_the_transfer_finished() {
    let data = blocks(3);
    let source = Arc::new(MockSource::new(&data, &[]));
    let rec = Arc::new(Recorder::default());

    let controls = DownloadControls::builder(source, Arc::new(MockFetcher::new(&data)))
        .callbacks(rec.callbacks())
        .build()
        .unwrap();
    let out = collect(controls.start().unwrap()).await.unwrap();
    assert_eq!(out, joined(&data));

    // The reader has seen the end; the background task may not have
    // recorded it yet.
    controls.cancel();

    eventually(|| rec.finishes.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controls.state(), PipelineState::Finished);
    assert!(rec.errors.lock().is_empty());
    assert_eq!(rec.finishes.load(Ordering::SeqCst), 1);
}
