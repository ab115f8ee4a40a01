use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockFetcher, BlockLocator, BoxByteStream};
use crate::error::TransferError;

/// Header carrying the per-block storage token next to a block URL.
pub const STORAGE_TOKEN_HEADER: &str = "pm-storage-token";

/// Fetches [`BlockLocator::Url`] blocks over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpBlockFetcher {
    client: reqwest::Client,
}

impl HttpBlockFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockFetcher for HttpBlockFetcher {
    async fn fetch_block(
        &self,
        cancel: &CancellationToken,
        locator: &BlockLocator,
    ) -> Result<BoxByteStream, TransferError> {
        let BlockLocator::Url { url, token } = locator else {
            return Err(TransferError::UnexpectedData(
                "HTTP blocks must be addressed by URL".into(),
            ));
        };
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.header(STORAGE_TOKEN_HEADER, token);
        }

        let response = tokio::select! {
            response = request.send() => response.map_err(map_reqwest_err)?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransferError::ExpiredBlock(format!("{url} returned 404")));
        }
        if !status.is_success() {
            return Err(TransferError::Transport(format!("{url} returned {status}")));
        }

        let stream = response.bytes_stream().map(|r| r.map_err(map_reqwest_err));
        Ok(Box::pin(stream))
    }
}

fn map_reqwest_err(err: reqwest::Error) -> TransferError {
    if err.is_connect() || err.is_timeout() || err.is_body() || err.is_request() {
        TransferError::Network(err.to_string())
    } else {
        TransferError::Transport(err.to_string())
    }
}
