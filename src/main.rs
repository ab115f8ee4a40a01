use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use blockdl::config::{AppConfig, CliArgs, OperatingMode};
use blockdl::controls::{DownloadBuilder, DownloadCallbacks, DownloadControls};
use blockdl::handler::ProxyState;
use blockdl::http::HttpBlockFetcher;
use blockdl::manifest::{DigestList, Manifest, ManifestSource};
use blockdl::planner::RangeSource;
use blockdl::s3::{AwsUpstream, S3BlockFetcher, Upstream};
use blockdl::server::run_server;
use blockdl::trace::TraceWriter;
use blockdl::transform::Sha256Transform;

/// Pause after a dropped connection before the transfer is resumed.
const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(2);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let trace = match args.debug_trace.as_deref() {
        Some(p) => {
            let tw = TraceWriter::new(Path::new(p))
                .with_context(|| format!("failed to create debug trace file {p}"))?;
            info!(path = p, "debug trace enabled");
            Some(Arc::new(tw))
        }
        None => None,
    };
    let config = Arc::new(AppConfig::try_from(args)?);

    let upstream: Option<Arc<dyn Upstream>> = if config.needs_s3() {
        Some(Arc::new(AwsUpstream::new(build_s3_client(&config).await)))
    } else {
        None
    };

    let result = match (&config.mode, upstream) {
        (OperatingMode::Serve { bind_ip, port }, Some(upstream)) => {
            let state = ProxyState {
                config: config.clone(),
                upstream,
                trace: trace.clone(),
            };
            let addr = SocketAddr::new(*bind_ip, *port);
            let listener = TcpListener::bind(addr).await?;
            info!("blockdl listening on http://{addr}");
            run_server(listener, state).await.map_err(anyhow::Error::from)
        }
        (
            OperatingMode::GetObject {
                key,
                digests,
                expect_etag,
                output,
            },
            Some(upstream),
        ) => {
            let meta = upstream.head_object(config.bucket(), key).await?;
            info!(key, size = meta.content_length, "object found");

            let digests = match digests {
                Some(path) => DigestList::load(path).await?.digests(),
                None => Vec::new(),
            };
            let transform = Sha256Transform::new().with_etag_check(
                expect_etag.as_deref().map(unquote),
                meta.etag.as_deref().map(unquote),
            );
            let source =
                RangeSource::new(meta.content_length, config.block_size).with_digests(digests);
            let fetcher = S3BlockFetcher::new(upstream, config.bucket(), key.as_str());

            let builder = DownloadControls::builder(Arc::new(source), Arc::new(fetcher))
                .transform(Arc::new(transform))
                .config(config.pipeline.clone())
                .trace(trace.clone());
            download_to_file(builder, output).await
        }
        (OperatingMode::GetManifest { manifest, output }, _) => {
            let manifest = Manifest::load(manifest).await?;
            info!(blocks = manifest.blocks.len(), "manifest loaded");
            let source = ManifestSource::new(manifest);

            let builder =
                DownloadControls::builder(Arc::new(source), Arc::new(HttpBlockFetcher::default()))
                    .transform(Arc::new(Sha256Transform::new()))
                    .config(config.pipeline.clone())
                    .trace(trace.clone());
            download_to_file(builder, output).await
        }
        (_, None) => Err(anyhow::anyhow!("S3 client was not configured")),
    };

    if let Some(tw) = &trace {
        tw.flush();
    }
    result
}

/// Run one transfer into `output`. Network drops pause the transfer and it
/// is resumed after a short delay; Ctrl-C cancels it. A failed transfer
/// leaves no partial file behind.
async fn download_to_file(builder: DownloadBuilder, output: &Path) -> anyhow::Result<()> {
    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let progress = Arc::new(AtomicI64::new(0));
    let reported = progress.clone();
    let callbacks = DownloadCallbacks::new()
        .on_init(|total| info!(total, "transfer starting"))
        .on_progress(move |delta| {
            reported.fetch_add(delta, Ordering::Relaxed);
        })
        .on_network_error(move |err| {
            warn!("{err}, retrying in {}s", NETWORK_RETRY_DELAY.as_secs());
            let _ = net_tx.send(());
        });
    let controls = builder.callbacks(callbacks).build()?;

    let result = async {
        let mut blocks = controls.start()?;
        let file = tokio::fs::File::create(output)
            .await
            .with_context(|| format!("create {}", output.display()))?;
        let mut file = BufWriter::new(file);
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                chunk = blocks.next() => match chunk {
                    Some(chunk) => file.write_all(&chunk?).await?,
                    None => break,
                },
                Some(()) = net_rx.recv() => {
                    tokio::time::sleep(NETWORK_RETRY_DELAY).await;
                    controls.resume();
                }
                _ = ticker.tick() => {
                    info!(bytes = progress.load(Ordering::Relaxed), "downloading");
                }
                _ = &mut ctrl_c => {
                    controls.cancel();
                    anyhow::bail!("interrupted");
                }
            }
        }
        file.flush().await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(
                bytes = progress.load(Ordering::Relaxed),
                path = %output.display(),
                "download complete"
            );
            Ok(())
        }
        Err(err) => {
            controls.cancel();
            let _ = tokio::fs::remove_file(output).await;
            Err(err)
        }
    }
}

fn unquote(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

async fn build_s3_client(config: &AppConfig) -> aws_sdk_s3::Client {
    let region_provider = match &config.region {
        Some(r) => RegionProviderChain::first_try(Some(aws_config::Region::new(r.clone())))
            .or_default_provider(),
        None => RegionProviderChain::default_provider(),
    };
    let aws_cfg = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;

    let mut s3_builder = aws_sdk_s3::config::Builder::from(&aws_cfg);
    if let Some(url) = &config.s3_endpoint_url {
        s3_builder = s3_builder.endpoint_url(url);
    }
    if config.s3_force_path_style {
        s3_builder = s3_builder.force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(s3_builder.build())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blockdl=info,tower_http=info".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
