use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockSource, Page, PageRequest};
use crate::error::TransferError;

/// Source for small objects whose content is already resolved: every page
/// carries raw bytes instead of block descriptors.
#[derive(Debug, Clone, Default)]
pub struct InlineSource {
    chunks: Vec<Bytes>,
}

impl InlineSource {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
impl BlockSource for InlineSource {
    fn size_hint(&self) -> Option<u64> {
        Some(self.chunks.iter().map(|c| c.len() as u64).sum())
    }

    async fn fetch_page(
        &self,
        _cancel: &CancellationToken,
        request: PageRequest,
    ) -> Result<Page, TransferError> {
        let skip = request.from_index.saturating_sub(1) as usize;
        Ok(Page::Raw(
            self.chunks
                .iter()
                .skip(skip)
                .take(request.page_size)
                .cloned()
                .collect(),
        ))
    }
}
