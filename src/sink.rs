//! The single ordered output of a transfer.
//!
//! [`OutputSink`] is the writable end held by the pipeline; [`BlockStream`]
//! is the readable end handed to the caller. The sink is closed or aborted
//! exactly once. After an abort the reader sees the error and then the end
//! of the stream; bytes still queued are discarded.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Chunks queued between the pipeline and a slow reader.
const SINK_CAPACITY: usize = 16;

type Item = Result<Bytes, TransferError>;

struct SinkShared {
    aborted: CancellationToken,
    error: Mutex<Option<TransferError>>,
}

pub struct OutputSink {
    tx: Mutex<Option<mpsc::Sender<Item>>>,
    shared: Arc<SinkShared>,
    finished: AtomicBool,
}

impl OutputSink {
    pub fn new() -> (Self, BlockStream) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let shared = Arc::new(SinkShared {
            aborted: CancellationToken::new(),
            error: Mutex::new(None),
        });
        let sink = Self {
            tx: Mutex::new(Some(tx)),
            shared: shared.clone(),
            finished: AtomicBool::new(false),
        };
        let stream = BlockStream {
            rx,
            shared,
            ended: false,
        };
        (sink, stream)
    }

    /// Queue one chunk. Fails with `Cancelled` once the sink is closed,
    /// aborted, or the reader has gone away.
    pub async fn write(&self, chunk: Bytes) -> Result<(), TransferError> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(TransferError::Cancelled);
        };
        tokio::select! {
            sent = tx.send(Ok(chunk)) => sent.map_err(|_| TransferError::Cancelled),
            _ = self.shared.aborted.cancelled() => Err(TransferError::Cancelled),
        }
    }

    /// End the stream normally. Returns false if the sink was already
    /// closed or aborted.
    pub fn close(&self) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.lock().take();
        true
    }

    /// End the stream with `error`. Returns false if the sink was already
    /// closed or aborted.
    pub fn abort(&self, error: TransferError) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.shared.error.lock() = Some(error);
        self.shared.aborted.cancel();
        self.tx.lock().take();
        true
    }
}

/// Readable side of an [`OutputSink`].
pub struct BlockStream {
    rx: mpsc::Receiver<Item>,
    shared: Arc<SinkShared>,
    ended: bool,
}

impl BlockStream {
    fn take_abort(&mut self) -> Option<TransferError> {
        if !self.shared.aborted.is_cancelled() {
            return None;
        }
        self.ended = true;
        self.rx.close();
        Some(
            self.shared
                .error
                .lock()
                .clone()
                .unwrap_or(TransferError::Cancelled),
        )
    }
}

impl Stream for BlockStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        if self.ended {
            return Poll::Ready(None);
        }
        if let Some(err) = self.take_abort() {
            return Poll::Ready(Some(Err(err)));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                if let Some(err) = self.take_abort() {
                    return Poll::Ready(Some(Err(err)));
                }
                self.ended = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
