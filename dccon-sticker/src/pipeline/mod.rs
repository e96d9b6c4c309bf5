//! Per-asset processing: sniff, upscale, encode to a size-bounded sticker.

mod asset;

pub use asset::AssetPipeline;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::domain::{PackId, Sticker};
use crate::source::PackAsset;

/// Turns one fetched asset into a finished sticker file under `sticker_dir`.
///
/// Returns [`Error::Cancelled`](crate::Error::Cancelled) when `cancel` fires
/// at a stage boundary.
#[async_trait]
pub trait AssetProcessor: Send + Sync {
    async fn process(
        &self,
        pack_id: PackId,
        asset: &PackAsset,
        sticker_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Sticker>;
}
