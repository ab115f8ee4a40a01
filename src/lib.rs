pub mod block;
pub mod config;
mod controller;
pub mod controls;
pub mod error;
pub mod handler;
pub mod http;
pub mod manifest;
pub mod memory;
pub mod planner;
pub mod reorder;
pub mod s3;
pub mod server;
pub mod sink;
pub mod trace;
pub mod transform;

pub use block::{BlockDescriptor, BlockFetcher, BlockLocator, BlockSource, Page, PageRequest};
pub use config::PipelineConfig;
pub use controls::{DownloadBuilder, DownloadCallbacks, DownloadControls, PipelineState};
pub use error::{TransferError, TransferResult};
pub use sink::BlockStream;
pub use transform::{BlockTransform, IdentityTransform, Sha256Transform, VerificationStatus};
