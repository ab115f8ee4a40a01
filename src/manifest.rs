//! JSON block manifests: a list of block URLs with optional storage tokens
//! and SHA-256 digests, paged out exactly like a remote block listing.
//!
//! ```json
//! {
//!   "size": 8388608,
//!   "blocks": [
//!     { "url": "https://storage.example/b/1", "token": "t1", "sha256": "9f86..." },
//!     { "url": "https://storage.example/b/2" }
//!   ]
//! }
//! ```
//!
//! A digest list uses the same layout with every field optional, so a block
//! manifest doubles as the `--digests` file.

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockDescriptor, BlockLocator, BlockSource, Page, PageRequest};
use crate::error::TransferError;

/// Blocks to download. Every block must name a URL.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub size: Option<u64>,
    pub blocks: Vec<ManifestBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestBlock {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Per-block digests for an object whose blocks are located elsewhere.
#[derive(Debug, Clone, Deserialize)]
pub struct DigestList {
    pub blocks: Vec<DigestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestEntry {
    #[serde(default)]
    pub sha256: Option<String>,
}

fn parse<T: DeserializeOwned>(text: &str) -> Result<T, TransferError> {
    serde_json::from_str(text)
        .map_err(|e| TransferError::UnexpectedData(format!("invalid manifest: {e}")))
}

async fn read<T: DeserializeOwned>(path: &Path) -> Result<T, TransferError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| TransferError::Internal(format!("read manifest {}: {e}", path.display())))?;
    parse(&text)
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        parse(text)
    }

    pub async fn load(path: &Path) -> Result<Self, TransferError> {
        read(path).await
    }
}

impl DigestList {
    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        parse(text)
    }

    pub async fn load(path: &Path) -> Result<Self, TransferError> {
        read(path).await
    }

    /// Digests in block order; blocks without one get "".
    pub fn digests(&self) -> Vec<String> {
        self.blocks
            .iter()
            .map(|b| b.sha256.clone().unwrap_or_default())
            .collect()
    }
}

/// Serves a [`Manifest`] page by page.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    manifest: Manifest,
}

impl ManifestSource {
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }
}

#[async_trait]
impl BlockSource for ManifestSource {
    fn size_hint(&self) -> Option<u64> {
        self.manifest.size
    }

    async fn fetch_page(
        &self,
        _cancel: &CancellationToken,
        request: PageRequest,
    ) -> Result<Page, TransferError> {
        let skip = request.from_index.saturating_sub(1) as usize;
        let blocks = self
            .manifest
            .blocks
            .iter()
            .enumerate()
            .skip(skip)
            .take(request.page_size)
            .map(|(i, b)| BlockDescriptor {
                index: i as u64 + 1,
                locator: BlockLocator::Url {
                    url: b.url.clone(),
                    token: b.token.clone(),
                },
                encoded_signature: b.sha256.clone().unwrap_or_default(),
            })
            .collect();
        Ok(Page::Blocks(blocks))
    }
}
