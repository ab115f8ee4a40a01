//! Block metadata and the two transport seams the pipeline consumes:
//! a paginated [`BlockSource`] and a per-block [`BlockFetcher`].

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Where the raw bytes of one block live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLocator {
    /// Pre-signed URL plus an optional storage token sent alongside it.
    Url { url: String, token: Option<String> },
    /// Inclusive byte range of the object the fetcher is bound to.
    Range { start: u64, end_inclusive: u64 },
}

/// One chunk of the remote object. `index` is 1-based and global across pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub index: u64,
    pub locator: BlockLocator,
    pub encoded_signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub from_index: u64,
    pub page_size: usize,
}

impl PageRequest {
    pub fn next(self) -> Self {
        Self {
            from_index: self.from_index + self.page_size as u64,
            page_size: self.page_size,
        }
    }
}

/// A single metadata page. A source returns either descriptors to fetch or
/// bytes that are already resolved; the first page decides which.
#[derive(Debug, Clone)]
pub enum Page {
    Blocks(Vec<BlockDescriptor>),
    Raw(Vec<Bytes>),
}

impl Page {
    pub fn len(&self) -> usize {
        match self {
            Page::Blocks(b) => b.len(),
            Page::Raw(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A page shorter than the requested size is the last one.
    pub fn has_more(&self, page_size: usize) -> bool {
        self.len() == page_size
    }
}

#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Total object size when it is known up front.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Fetch one page of block metadata. Must return the same logical page
    /// when called again with the same `from_index`.
    async fn fetch_page(
        &self,
        cancel: &CancellationToken,
        request: PageRequest,
    ) -> Result<Page, TransferError>;
}

#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Open a byte stream for one block. Cancelling `cancel` must stop the
    /// transport promptly. A block whose locator went stale fails with
    /// [`TransferError::ExpiredBlock`].
    async fn fetch_block(
        &self,
        cancel: &CancellationToken,
        locator: &BlockLocator,
    ) -> Result<BoxByteStream, TransferError>;
}
