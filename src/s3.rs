use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::Client;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockFetcher, BlockLocator, BoxByteStream};
use crate::error::TransferError;

/// Metadata returned by a HEAD on an S3 object.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Abstraction over S3 access, enabling mock implementations for testing.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, TransferError>;

    /// Fetch a byte range as an async stream.
    async fn get_range_stream(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<BoxByteStream, TransferError>;
}

/// Production S3 client backed by the official AWS SDK.
#[derive(Clone)]
pub struct AwsUpstream {
    client: Client,
}

impl AwsUpstream {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for AwsUpstream {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, TransferError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_head_err)?;

        Ok(ObjectMeta {
            content_length: output.content_length().unwrap_or_default().max(0) as u64,
            content_type: output.content_type().map(str::to_owned),
            etag: output.e_tag().map(str::to_owned),
            last_modified: output.last_modified().map(|t| {
                // HTTP wants RFC 7231 dates, not the SDK's ISO 8601.
                let epoch =
                    std::time::UNIX_EPOCH + std::time::Duration::from_secs(t.secs().max(0) as u64);
                httpdate::fmt_http_date(epoch)
            }),
            metadata: output.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn get_range_stream(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<BoxByteStream, TransferError> {
        let range = format!("bytes={start}-{end_inclusive}");
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(map_get_err)?;

        let reader = output.body.into_async_read();
        // A read failure mid-body is a dropped connection.
        let stream = ReaderStream::with_capacity(reader, 256 * 1024)
            .map(|r| r.map_err(|e| TransferError::Network(e.to_string())));
        Ok(Box::pin(stream))
    }
}

fn map_head_err(err: SdkError<HeadObjectError>) -> TransferError {
    match &err {
        SdkError::ServiceError(se) if se.err().is_not_found() => {
            TransferError::NotFound("object not found".into())
        }
        _ => map_sdk_err(err),
    }
}

fn map_get_err(err: SdkError<GetObjectError>) -> TransferError {
    match &err {
        SdkError::ServiceError(se) if se.err().is_no_such_key() => {
            TransferError::ExpiredBlock("object no longer exists".into())
        }
        _ => map_sdk_err(err),
    }
}

fn map_sdk_err<E: std::error::Error + Send + Sync + 'static>(err: SdkError<E>) -> TransferError {
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            TransferError::Network(err.to_string())
        }
        _ => TransferError::Transport(err.to_string()),
    }
}

/// Fetches [`BlockLocator::Range`] blocks of one S3 object.
#[derive(Clone)]
pub struct S3BlockFetcher {
    upstream: Arc<dyn Upstream>,
    bucket: String,
    key: String,
}

impl S3BlockFetcher {
    pub fn new(upstream: Arc<dyn Upstream>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            upstream,
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl BlockFetcher for S3BlockFetcher {
    async fn fetch_block(
        &self,
        cancel: &CancellationToken,
        locator: &BlockLocator,
    ) -> Result<BoxByteStream, TransferError> {
        let BlockLocator::Range { start, end_inclusive } = locator else {
            return Err(TransferError::UnexpectedData(
                "S3 blocks must be addressed by byte range".into(),
            ));
        };
        tokio::select! {
            stream = self.upstream.get_range_stream(&self.bucket, &self.key, *start, *end_inclusive) => stream,
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }
}
