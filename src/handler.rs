use std::sync::Arc;
use std::time::Instant;

use async_stream::try_stream;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, SERVER};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::controls::{DownloadCallbacks, DownloadControls};
use crate::error::{TransferError, TransferResult};
use crate::planner::RangeSource;
use crate::s3::{ObjectMeta, S3BlockFetcher, Upstream};
use crate::trace::{trace_log, TraceWriter};

const SERVER_NAME: &str = concat!("blockdl/", env!("CARGO_PKG_VERSION"));

/// Shared application state injected into every request handler.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub upstream: Arc<dyn Upstream>,
    pub trace: Option<Arc<TraceWriter>>,
}

pub async fn handle_head(
    State(state): State<ProxyState>,
    Path(key): Path<String>,
) -> TransferResult<impl IntoResponse> {
    let key = normalize_key(&key);
    let meta = state.upstream.head_object(state.config.bucket(), &key).await?;
    Ok(build_response(&meta, Body::empty()))
}

/// Stream the object through the block pipeline. Blocks are fetched in
/// parallel and the body receives them in order.
pub async fn handle_get(
    State(state): State<ProxyState>,
    Path(key): Path<String>,
) -> TransferResult<Response<Body>> {
    let key = normalize_key(&key);
    let bucket = state.config.bucket();
    let meta = state.upstream.head_object(bucket, &key).await?;

    if meta.content_length == 0 {
        return Ok(build_response(&meta, Body::empty()));
    }

    let source = RangeSource::new(meta.content_length, state.config.block_size);
    trace_log(&state.trace, || json!({
        "event": "request",
        "key": key,
        "size": meta.content_length,
        "block_size": state.config.block_size,
        "blocks": source.plan().block_count(),
    }));

    let fetcher = S3BlockFetcher::new(state.upstream.clone(), bucket, key.clone());
    let failed_key = key.clone();
    let callbacks = DownloadCallbacks::new().on_error(move |err| {
        if !err.is_cancelled() {
            warn!(key = %failed_key, "transfer failed: {err}");
        }
    });
    let controls = Arc::new(
        DownloadControls::builder(Arc::new(source), Arc::new(fetcher))
            .config(state.config.pipeline.clone())
            .callbacks(callbacks)
            .trace(state.trace.clone())
            .build()?,
    );
    let mut blocks = controls.start()?;

    let trace = state.trace.clone();
    let body_stream = try_stream! {
        // Stops the transfer if the client goes away mid-body.
        let mut guard = CancelOnDrop { controls, completed: false };
        let t0 = Instant::now();
        let mut sent = 0u64;

        while let Some(chunk) = blocks.next().await {
            let chunk: Bytes = chunk?;
            sent += chunk.len() as u64;
            yield chunk;
        }
        guard.completed = true;

        let elapsed = t0.elapsed();
        debug!(key, bytes = sent, "object served");
        trace_log(&trace, || json!({
            "event": "served",
            "key": key,
            "bytes": sent,
            "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
        }));
    };

    let body = Body::from_stream(body_stream.map(|r: Result<Bytes, TransferError>| {
        r.map_err(|e| std::io::Error::other(e.to_string()))
    }));
    Ok(build_response(&meta, body))
}

struct CancelOnDrop {
    controls: Arc<DownloadControls>,
    completed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.completed {
            self.controls.cancel();
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim_start_matches('/').to_string()
}

fn build_response(meta: &ObjectMeta, body: Body) -> Response<Body> {
    let mut b = Response::builder()
        .status(StatusCode::OK)
        .header(SERVER, SERVER_NAME)
        .header(CONTENT_LENGTH, meta.content_length);
    if let Some(v) = &meta.content_type {
        b = b.header(CONTENT_TYPE, v.as_str());
    }
    if let Some(v) = &meta.etag {
        b = b.header(ETAG, v.as_str());
    }
    if let Some(v) = &meta.last_modified {
        b = b.header(LAST_MODIFIED, v.as_str());
    }
    b.body(body).unwrap_or_else(|_| Response::new(Body::empty()))
}
