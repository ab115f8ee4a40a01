//! Caller-facing handle of one transfer: start, pause, resume, cancel.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::block::{BlockFetcher, BlockSource};
use crate::config::PipelineConfig;
use crate::controller::{Controller, PipelineShared, RetryBudget};
use crate::error::{TransferError, TransferResult};
use crate::sink::{BlockStream, OutputSink};
use crate::trace::TraceWriter;
use crate::transform::{BlockTransform, IdentityTransform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Aborted,
    Errored,
    Finished,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Aborted | PipelineState::Errored | PipelineState::Finished
        )
    }
}

type InitFn = dyn Fn(u64) + Send + Sync;
type ProgressFn = dyn Fn(i64) + Send + Sync;
type ErrorFn = dyn Fn(&TransferError) + Send + Sync;
type FinishFn = dyn Fn() + Send + Sync;

/// Observers of a transfer. Progress deltas are raw block bytes and go
/// negative when unflushed bytes are retracted.
///
/// Without a network-error observer, connectivity failures are fatal.
#[derive(Clone, Default)]
pub struct DownloadCallbacks {
    on_init: Option<Arc<InitFn>>,
    on_progress: Option<Arc<ProgressFn>>,
    on_network_error: Option<Arc<ErrorFn>>,
    on_error: Option<Arc<ErrorFn>>,
    on_finish: Option<Arc<FinishFn>>,
}

impl DownloadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_init(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_init = Some(Arc::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_network_error(mut self, f: impl Fn(&TransferError) + Send + Sync + 'static) -> Self {
        self.on_network_error = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TransferError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }

    pub(crate) fn init(&self, total: u64) {
        if let Some(f) = &self.on_init {
            f(total);
        }
    }

    pub(crate) fn progress(&self, delta: i64) {
        if let Some(f) = &self.on_progress {
            f(delta);
        }
    }

    pub(crate) fn handles_network_errors(&self) -> bool {
        self.on_network_error.is_some()
    }

    pub(crate) fn network_error(&self, err: &TransferError) {
        if let Some(f) = &self.on_network_error {
            f(err);
        }
    }

    pub(crate) fn error(&self, err: &TransferError) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }

    pub(crate) fn finish(&self) {
        if let Some(f) = &self.on_finish {
            f();
        }
    }
}

impl fmt::Debug for DownloadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCallbacks")
            .field("on_init", &self.on_init.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_network_error", &self.on_network_error.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

/// Assembles the collaborators of one transfer.
pub struct DownloadBuilder {
    source: Arc<dyn BlockSource>,
    fetcher: Arc<dyn BlockFetcher>,
    transform: Arc<dyn BlockTransform>,
    callbacks: DownloadCallbacks,
    config: PipelineConfig,
    trace: Option<Arc<TraceWriter>>,
}

impl DownloadBuilder {
    pub fn new(source: Arc<dyn BlockSource>, fetcher: Arc<dyn BlockFetcher>) -> Self {
        Self {
            source,
            fetcher,
            transform: Arc::new(IdentityTransform),
            callbacks: DownloadCallbacks::default(),
            config: PipelineConfig::default(),
            trace: None,
        }
    }

    pub fn transform(mut self, transform: Arc<dyn BlockTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn callbacks(mut self, callbacks: DownloadCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn trace(mut self, trace: Option<Arc<TraceWriter>>) -> Self {
        self.trace = trace;
        self
    }

    /// Assemble the transfer. Fails with `InvalidConfig` when a pipeline
    /// knob is zero.
    pub fn build(self) -> TransferResult<DownloadControls> {
        self.config.validate()?;
        let shared = Arc::new(PipelineShared::new());
        let (sink, readable) = OutputSink::new();
        let sink = Arc::new(sink);
        let controller = Controller {
            source: self.source,
            fetcher: self.fetcher,
            transform: self.transform,
            callbacks: self.callbacks.clone(),
            retries: RetryBudget::new(&self.config),
            config: self.config,
            shared: shared.clone(),
            sink: sink.clone(),
            trace: self.trace,
        };
        Ok(DownloadControls {
            shared,
            sink,
            callbacks: self.callbacks,
            unstarted: Mutex::new(Some((controller, readable))),
        })
    }
}

/// Handle to one transfer. Cloneable through `Arc` by the caller; every
/// method takes `&self`.
pub struct DownloadControls {
    shared: Arc<PipelineShared>,
    sink: Arc<OutputSink>,
    callbacks: DownloadCallbacks,
    unstarted: Mutex<Option<(Controller, BlockStream)>>,
}

impl DownloadControls {
    pub fn builder(source: Arc<dyn BlockSource>, fetcher: Arc<dyn BlockFetcher>) -> DownloadBuilder {
        DownloadBuilder::new(source, fetcher)
    }

    /// Begin the transfer in the background and return the ordered output.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> TransferResult<BlockStream> {
        if self.shared.is_aborted() {
            return Err(TransferError::Cancelled);
        }
        let Some((controller, readable)) = self.unstarted.lock().take() else {
            return Err(TransferError::AlreadyStarted);
        };
        self.shared.update(|s| {
            s.state = if s.paused {
                PipelineState::Paused
            } else {
                PipelineState::Running
            };
        });

        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let result = controller.run().await;
            match result {
                Ok(()) => {
                    shared.update(|s| s.state = PipelineState::Finished);
                    info!("transfer finished");
                    callbacks.finish();
                }
                Err(err) => {
                    shared.update(|s| s.cancel.cancel());
                    // Whoever ends the sink first owns the outcome. Losing
                    // here means cancel() already reported.
                    if !sink.abort(err.clone()) {
                        debug!("transfer stopped after cancel");
                        return;
                    }
                    shared.update(|s| s.state = PipelineState::Errored);
                    error!("transfer failed: {err}");
                    callbacks.error(&err);
                }
            }
        });

        Ok(readable)
    }

    /// Stop in-flight block fetches. Resolves once the progress of every
    /// interrupted block has been retracted, so no progress is reported
    /// until [`resume`](Self::resume).
    pub async fn pause(&self) {
        let pausing = self.shared.update(|s| {
            if s.state.is_terminal() || s.aborted {
                return false;
            }
            s.paused = true;
            if s.state == PipelineState::Running {
                s.state = PipelineState::Paused;
            }
            s.cancel.cancel();
            true
        });
        if !pausing {
            return;
        }
        debug!("pausing transfer");
        self.shared
            .wait_until(|s| s.buffer.in_progress_bytes() == 0 || s.aborted || s.state.is_terminal())
            .await;
    }

    /// Issue a fresh cancellation token and let the controller restart from
    /// the active block.
    pub fn resume(&self) {
        self.shared.update(|s| {
            if s.aborted || s.state.is_terminal() {
                return;
            }
            s.cancel = CancellationToken::new();
            s.paused = false;
            if s.state == PipelineState::Paused {
                s.state = PipelineState::Running;
            }
        });
        debug!("resuming transfer");
    }

    /// Abort the transfer. The reader sees `Cancelled` and the error
    /// observer is called once.
    pub fn cancel(&self) {
        // A sink that is already closed or aborted means the transfer has
        // ended and reported its own outcome.
        if !self.sink.abort(TransferError::Cancelled) {
            return;
        }
        self.shared.update(|s| {
            s.paused = false;
            s.aborted = true;
            s.state = PipelineState::Aborted;
            s.cancel.cancel();
        });
        info!("transfer cancelled");
        self.callbacks.error(&TransferError::Cancelled);
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }
}
