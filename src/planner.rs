use std::cmp::min;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockDescriptor, BlockLocator, BlockSource, Page, PageRequest};
use crate::error::TransferError;

/// Fixed-size block layout of an object of known size. Block indices are
/// 1-based; the last block may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub object_size: u64,
    pub block_size: u64,
}

impl BlockPlan {
    pub fn new(object_size: u64, block_size: u64) -> Self {
        Self {
            object_size,
            block_size: block_size.max(1),
        }
    }

    pub fn block_count(&self) -> u64 {
        self.object_size.div_ceil(self.block_size)
    }

    /// Inclusive byte range `(start, end_inclusive)` of block `index`, or
    /// `None` past the end of the object.
    pub fn block_range(&self, index: u64) -> Option<(u64, u64)> {
        if index == 0 || index > self.block_count() {
            return None;
        }
        let start = (index - 1) * self.block_size;
        let end_inclusive = min(start + self.block_size, self.object_size) - 1;
        Some((start, end_inclusive))
    }

    /// Indices `from_index..` of at most `page_size` blocks that exist.
    pub fn page(&self, from_index: u64, page_size: usize) -> impl Iterator<Item = (u64, (u64, u64))> + '_ {
        let from = from_index.max(1);
        let last = min(
            from.saturating_add(page_size as u64).saturating_sub(1),
            self.block_count(),
        );
        (from..=last).filter_map(move |i| self.block_range(i).map(|r| (i, r)))
    }
}

/// Block source for an object of known size fetched by byte range, such as
/// an S3 object. Optional per-block SHA-256 digests become the blocks'
/// encoded signatures.
#[derive(Debug, Clone)]
pub struct RangeSource {
    plan: BlockPlan,
    digests: Vec<String>,
}

impl RangeSource {
    pub fn new(object_size: u64, block_size: u64) -> Self {
        Self {
            plan: BlockPlan::new(object_size, block_size),
            digests: Vec::new(),
        }
    }

    /// Digest of block `i` is `digests[i - 1]`.
    pub fn with_digests(mut self, digests: Vec<String>) -> Self {
        self.digests = digests;
        self
    }

    pub fn plan(&self) -> BlockPlan {
        self.plan
    }
}

#[async_trait]
impl BlockSource for RangeSource {
    fn size_hint(&self) -> Option<u64> {
        Some(self.plan.object_size)
    }

    async fn fetch_page(
        &self,
        _cancel: &CancellationToken,
        request: PageRequest,
    ) -> Result<Page, TransferError> {
        let blocks = self
            .plan
            .page(request.from_index, request.page_size)
            .map(|(index, (start, end_inclusive))| BlockDescriptor {
                index,
                locator: BlockLocator::Range { start, end_inclusive },
                encoded_signature: self
                    .digests
                    .get(index as usize - 1)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        Ok(Page::Blocks(blocks))
    }
}
