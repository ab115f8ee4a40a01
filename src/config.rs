use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use byte_unit::Byte;
use clap::{Parser, Subcommand};

use crate::error::{TransferError, TransferResult};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BLOCK_SIZE: &str = "4MiB";
const DEFAULT_MAX_DOWNLOADING_BLOCKS: usize = 10;
const DEFAULT_MAX_PARALLEL_FETCHES: usize = 5;
const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_RESET_SECONDS: u64 = 10;

/// Knobs of one block transfer.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Blocks that may sit in the reorder buffer at once (downloading or
    /// finished but waiting for a predecessor).
    pub max_downloading_blocks: usize,
    /// Block fetches driven concurrently.
    pub max_parallel_fetches: usize,
    /// Blocks requested per metadata page.
    pub page_size: usize,
    /// Expired-block retries before the transfer fails.
    pub max_retries: u32,
    /// A retry that follows the previous one by more than this resets the
    /// retry counter to 1.
    pub retry_reset_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_downloading_blocks: DEFAULT_MAX_DOWNLOADING_BLOCKS,
            max_parallel_fetches: DEFAULT_MAX_PARALLEL_FETCHES,
            page_size: DEFAULT_PAGE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_reset_window: Duration::from_secs(DEFAULT_RETRY_RESET_SECONDS),
        }
    }
}

impl PipelineConfig {
    /// Every knob that bounds a loop or a slot count must be at least one.
    pub fn validate(&self) -> TransferResult<()> {
        let knobs = [
            ("max-downloading-blocks", self.max_downloading_blocks),
            ("max-parallel-fetches", self.max_parallel_fetches),
            ("page-size", self.page_size),
        ];
        for (name, value) in knobs {
            if value == 0 {
                return Err(TransferError::InvalidConfig(format!("{name} must be >= 1")));
            }
        }
        Ok(())
    }
}

/// Chunked, resumable, integrity-verified block downloads from S3 or from a
/// block manifest.
#[derive(Debug, Clone, Parser)]
#[command(name = "blockdl", version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// S3 bucket name. Required unless a manifest is used.
    #[arg(long, global = true, env = "BLOCKDL_BUCKET")]
    pub bucket: Option<String>,

    /// AWS region. Falls back to SDK default resolution chain.
    #[arg(long, global = true, env = "BLOCKDL_REGION")]
    pub region: Option<String>,

    /// Override S3 endpoint URL (for LocalStack or S3-compatible services).
    #[arg(long, global = true, env = "BLOCKDL_S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Force path-style S3 addressing (required for LocalStack).
    #[arg(long, global = true, env = "BLOCKDL_S3_FORCE_PATH_STYLE", default_value_t = false)]
    pub s3_force_path_style: bool,

    /// Size of one block when splitting an S3 object, e.g. 4MiB.
    #[arg(
        long,
        global = true,
        env = "BLOCKDL_BLOCK_SIZE",
        default_value = DEFAULT_BLOCK_SIZE,
        value_parser = parse_byte_size
    )]
    pub block_size: u64,

    /// Blocks buffered at once while waiting for in-order delivery.
    #[arg(
        long,
        global = true,
        env = "BLOCKDL_MAX_DOWNLOADING_BLOCKS",
        default_value_t = DEFAULT_MAX_DOWNLOADING_BLOCKS
    )]
    pub max_downloading_blocks: usize,

    /// Block fetches running concurrently per transfer.
    #[arg(
        long,
        global = true,
        env = "BLOCKDL_MAX_PARALLEL_FETCHES",
        default_value_t = DEFAULT_MAX_PARALLEL_FETCHES
    )]
    pub max_parallel_fetches: usize,

    /// Blocks requested per metadata page.
    #[arg(long, global = true, env = "BLOCKDL_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Expired-block retries before a transfer fails.
    #[arg(long, global = true, env = "BLOCKDL_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Seconds between retries after which the retry counter starts over.
    #[arg(
        long,
        global = true,
        env = "BLOCKDL_RETRY_RESET_SECONDS",
        default_value_t = DEFAULT_RETRY_RESET_SECONDS
    )]
    pub retry_reset_seconds: u64,

    /// Path to write JSONL debug trace (block timing, flushes, retries).
    /// Disabled when omitted.
    #[arg(long, global = true, env = "BLOCKDL_DEBUG_TRACE")]
    pub debug_trace: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Download one object to a local file.
    Get {
        /// S3 object key.
        #[arg(long, conflicts_with = "manifest")]
        key: Option<String>,

        /// JSON block manifest to download instead of an S3 object.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Per-block SHA-256 digests for an S3 object, as a JSON manifest
        /// whose `blocks[].sha256` entries are used.
        #[arg(long, requires = "key")]
        digests: Option<PathBuf>,

        /// Fail before downloading unless the object's ETag matches.
        #[arg(long, requires = "key")]
        expect_etag: Option<String>,

        /// Output file.
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Serve S3 objects over HTTP through the block pipeline.
    Serve {
        /// IP address to bind on. Omit to bind all interfaces.
        #[arg(long, env = "BLOCKDL_BIND_IP")]
        bind_ip: Option<IpAddr>,

        /// TCP port to listen on.
        #[arg(long, env = "BLOCKDL_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Debug, Clone)]
pub enum OperatingMode {
    GetObject {
        key: String,
        digests: Option<PathBuf>,
        expect_etag: Option<String>,
        output: PathBuf,
    },
    GetManifest {
        manifest: PathBuf,
        output: PathBuf,
    },
    Serve {
        bind_ip: IpAddr,
        port: u16,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: OperatingMode,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub s3_endpoint_url: Option<String>,
    pub s3_force_path_style: bool,
    pub block_size: u64,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn needs_s3(&self) -> bool {
        !matches!(self.mode, OperatingMode::GetManifest { .. })
    }

    /// Bucket for S3 modes. Validation guarantees presence.
    pub fn bucket(&self) -> &str {
        self.bucket.as_deref().unwrap_or_default()
    }
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        anyhow::ensure!(args.block_size > 0, "block-size must be > 0");

        let pipeline = PipelineConfig {
            max_downloading_blocks: args.max_downloading_blocks,
            max_parallel_fetches: args.max_parallel_fetches,
            page_size: args.page_size,
            max_retries: args.max_retries,
            retry_reset_window: Duration::from_secs(args.retry_reset_seconds),
        };
        pipeline.validate()?;

        let mode = match args.command {
            Command::Get {
                key: Some(key),
                digests,
                expect_etag,
                output,
                ..
            } => OperatingMode::GetObject {
                key,
                digests,
                expect_etag,
                output,
            },
            Command::Get {
                key: None,
                manifest: Some(manifest),
                output,
                ..
            } => OperatingMode::GetManifest { manifest, output },
            Command::Get { .. } => anyhow::bail!("get requires --key or --manifest"),
            Command::Serve { bind_ip, port } => OperatingMode::Serve {
                bind_ip: bind_ip.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0])),
                port,
            },
        };

        let config = Self {
            mode,
            bucket: args.bucket,
            region: args.region,
            s3_endpoint_url: args.s3_endpoint_url,
            s3_force_path_style: args.s3_force_path_style,
            block_size: args.block_size,
            pipeline,
        };
        anyhow::ensure!(
            !config.needs_s3() || config.bucket.is_some(),
            "--bucket is required for S3 downloads"
        );
        Ok(config)
    }
}

fn parse_byte_size(input: &str) -> Result<u64, String> {
    Byte::parse_str(input, true)
        .map(|b| b.as_u64())
        .map_err(|e| format!("invalid byte size: {e}"))
}
