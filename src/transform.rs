//! Per-block content transform and integrity verification.
//!
//! The controller hands every raw block stream to a [`BlockTransform`]. The
//! transform returns the stream to buffer plus a verification future that
//! resolves once the stream has been fully consumed.

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::block::BoxByteStream;
use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    NotSigned,
    SignedAndValid,
    SignedAndInvalid,
}

pub type VerificationFuture = BoxFuture<'static, Result<VerificationStatus, TransferError>>;

pub struct Transformed {
    pub stream: BoxByteStream,
    pub verification: VerificationFuture,
}

#[async_trait]
pub trait BlockTransform: Send + Sync {
    async fn apply(
        &self,
        cancel: &CancellationToken,
        raw: BoxByteStream,
        signature: &str,
    ) -> Result<Transformed, TransferError>;

    /// Called after the transformed stream is drained.
    async fn check_signature(
        &self,
        cancel: &CancellationToken,
        verification: VerificationFuture,
    ) -> Result<(), TransferError> {
        let status = tokio::select! {
            status = verification => status?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        match status {
            VerificationStatus::SignedAndInvalid => Err(TransferError::Integrity(
                "block signature does not match its content".into(),
            )),
            VerificationStatus::NotSigned | VerificationStatus::SignedAndValid => Ok(()),
        }
    }

    /// Whole-object check, run once before any block is fetched.
    async fn check_object_signature(&self, _cancel: &CancellationToken) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Passes bytes through untouched; every block verifies.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

#[async_trait]
impl BlockTransform for IdentityTransform {
    async fn apply(
        &self,
        _cancel: &CancellationToken,
        raw: BoxByteStream,
        _signature: &str,
    ) -> Result<Transformed, TransferError> {
        Ok(Transformed {
            stream: raw,
            verification: future::ready(Ok(VerificationStatus::SignedAndValid)).boxed(),
        })
    }
}

/// Verifies each block against a hex SHA-256 digest carried as its
/// encoded signature. Blocks without a digest are reported as not signed.
#[derive(Debug, Default, Clone)]
pub struct Sha256Transform {
    expected_etag: Option<String>,
    actual_etag: Option<String>,
}

impl Sha256Transform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the whole-object check unless `actual` equals `expected`.
    pub fn with_etag_check(mut self, expected: Option<String>, actual: Option<String>) -> Self {
        self.expected_etag = expected;
        self.actual_etag = actual;
        self
    }
}

#[async_trait]
impl BlockTransform for Sha256Transform {
    async fn apply(
        &self,
        _cancel: &CancellationToken,
        raw: BoxByteStream,
        signature: &str,
    ) -> Result<Transformed, TransferError> {
        let expected = signature.trim().to_ascii_lowercase();
        if expected.is_empty() {
            return Ok(Transformed {
                stream: raw,
                verification: future::ready(Ok(VerificationStatus::NotSigned)).boxed(),
            });
        }

        let (tx, rx) = oneshot::channel::<String>();
        let stream = hashing_stream(raw, tx);

        let verification = async move {
            let actual = rx.await.map_err(|_| {
                TransferError::Internal("block stream dropped before it was fully read".into())
            })?;
            Ok(if actual == expected {
                VerificationStatus::SignedAndValid
            } else {
                VerificationStatus::SignedAndInvalid
            })
        }
        .boxed();

        Ok(Transformed {
            stream: Box::pin(stream),
            verification,
        })
    }

    async fn check_object_signature(&self, _cancel: &CancellationToken) -> Result<(), TransferError> {
        match (&self.expected_etag, &self.actual_etag) {
            (Some(expected), actual) if actual.as_deref() != Some(expected.as_str()) => {
                Err(TransferError::Integrity(format!(
                    "object etag {actual:?} does not match expected {expected}"
                )))
            }
            _ => Ok(()),
        }
    }
}

fn hashing_stream(
    mut raw: BoxByteStream,
    digest_tx: oneshot::Sender<String>,
) -> impl Stream<Item = Result<Bytes, TransferError>> + Send {
    try_stream! {
        let mut hasher = Sha256::new();
        while let Some(piece) = raw.next().await {
            let piece = piece?;
            hasher.update(&piece);
            yield piece;
        }
        let _ = digest_tx.send(format!("{:x}", hasher.finalize()));
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, TryStreamExt};

    fn raw(parts: &[&'static [u8]]) -> BoxByteStream {
        Box::pin(stream::iter(
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>(),
        ))
    }

    async fn drain(t: &dyn BlockTransform, signature: &str) -> Result<Vec<u8>, TransferError> {
        let cancel = CancellationToken::new();
        let out = t.apply(&cancel, raw(&[b"hello ", b"world"]), signature).await?;
        let bytes: Vec<Bytes> = out.stream.try_collect().await?;
        t.check_signature(&cancel, out.verification).await?;
        Ok(bytes.concat())
    }

    #[tokio::test]
    async fn sha256_accepts_matching_digest() {
        let t = Sha256Transform::new();
        let digest = sha256_hex(b"hello world");
        assert_eq!(drain(&t, &digest).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn sha256_rejects_wrong_digest() {
        let t = Sha256Transform::new();
        let digest = sha256_hex(b"something else");
        assert!(matches!(
            drain(&t, &digest).await,
            Err(TransferError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn missing_digest_is_not_signed_and_accepted() {
        let t = Sha256Transform::new();
        assert_eq!(drain(&t, "").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn identity_passes_through() {
        assert_eq!(drain(&IdentityTransform, "ignored").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn etag_mismatch_fails_object_check() {
        let cancel = CancellationToken::new();
        let t = Sha256Transform::new()
            .with_etag_check(Some("\"a\"".into()), Some("\"b\"".into()));
        assert!(t.check_object_signature(&cancel).await.is_err());

        let t = Sha256Transform::new().with_etag_check(Some("\"a\"".into()), Some("\"a\"".into()));
        assert!(t.check_object_signature(&cancel).await.is_ok());

        let t = Sha256Transform::new().with_etag_check(None, Some("\"a\"".into()));
        assert!(t.check_object_signature(&cancel).await.is_ok());
    }
}
