//! Pack assembly: fetch, process every asset, register sticker sets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{PackId, Sticker};
use crate::jobs::{CancelReason, JobDirs, JobOutcome, JobRequest, JobRunner};
use crate::pipeline::AssetProcessor;
use crate::source::{self, FetchOutcome, FetchedPack, PackSource};
use crate::telegram::ChatPlatform;
use crate::{Error, Result};

/// Stickers a single `createNewStickerSet` call accepts.
pub const SET_BATCH_CAPACITY: u32 = 50;

const NAME_PREFIX_LEN: usize = 5;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random set name: five letters, the pack id, then `_by_<bot>`.
pub fn make_set_name(pack_id: PackId, bot_username: &str) -> String {
    let prefix: String = (0..NAME_PREFIX_LEN)
        .map(|_| LETTERS[(rand::random::<u32>() as usize) % LETTERS.len()] as char)
        .collect();
    format!("{prefix}{pack_id}_by_{bot_username}")
}

pub fn make_set_title(pack_title: &str, bot_username: &str) -> String {
    format!("{pack_title} @{bot_username}")
}

/// Split by ordinal: `1..=capacity` is primary, the rest is overflow.
pub fn partition_stickers(stickers: Vec<Sticker>, capacity: u32) -> (Vec<Sticker>, Vec<Sticker>) {
    stickers.into_iter().partition(|s| s.ordinal <= capacity)
}

/// Runs a whole pack through fetch, the asset pipeline and registration.
pub struct PackAssembler {
    source: Arc<dyn PackSource>,
    processor: Arc<dyn AssetProcessor>,
    platform: Arc<dyn ChatPlatform>,
    fetch_attempts: u32,
}

impl PackAssembler {
    pub fn new(
        source: Arc<dyn PackSource>,
        processor: Arc<dyn AssetProcessor>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        Self {
            source,
            processor,
            platform,
            fetch_attempts: source::MAX_FETCH_ATTEMPTS,
        }
    }

    pub fn with_fetch_attempts(mut self, attempts: u32) -> Self {
        self.fetch_attempts = attempts.max(1);
        self
    }

    /// Process assets in ordinal order, skipping the ones that fail.
    async fn process_assets(
        &self,
        pack: &FetchedPack,
        dirs: &JobDirs,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sticker>> {
        let mut stickers = Vec::with_capacity(pack.assets.len());

        for asset in &pack.assets {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self
                .processor
                .process(pack.pack_id, asset, &dirs.sticker_dir, cancel)
                .await
            {
                Ok(sticker) => stickers.push(sticker),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(pack_id = %pack.pack_id, ordinal = asset.ordinal, error = %e, "Asset skipped")
                }
            }
        }

        stickers.sort_by_key(|s| s.ordinal);
        Ok(stickers)
    }

    /// Create the set(s) and return their names.
    async fn register(
        &self,
        pack: &FetchedPack,
        stickers: Vec<Sticker>,
        split_overflow: bool,
    ) -> Result<Vec<String>> {
        let username = self.platform.bot_username();
        let title = make_set_title(&pack.title, username);
        let (mut primary, mut overflow) = partition_stickers(stickers, SET_BATCH_CAPACITY);
        if primary.is_empty() {
            std::mem::swap(&mut primary, &mut overflow);
        }

        let first = make_set_name(pack.pack_id, username);
        self.platform
            .create_sticker_set(&first, &title, &primary)
            .await?;
        let mut names = vec![first];

        if overflow.is_empty() {
            return Ok(names);
        }

        if split_overflow {
            let second = make_set_name(pack.pack_id, username);
            self.platform
                .create_sticker_set(&second, &title, &overflow)
                .await?;
            names.push(second);
        } else {
            for sticker in &overflow {
                self.platform.add_sticker_to_set(&names[0], sticker).await?;
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl JobRunner for PackAssembler {
    async fn run(&self, request: &JobRequest, dirs: &JobDirs, cancel: &CancellationToken) -> JobOutcome {
        let pack_id = request.pack_id;

        let pack = match source::fetch_validated(
            self.source.as_ref(),
            pack_id,
            &dirs.source_dir,
            self.fetch_attempts,
            cancel,
        )
        .await
        {
            Ok(FetchOutcome::Fetched(pack)) => pack,
            Ok(FetchOutcome::Cancelled) => return JobOutcome::Cancelled(CancelReason::Requested),
            Ok(FetchOutcome::ExhaustedRetries { attempts, reason }) => {
                return JobOutcome::Failed {
                    reason: format!("fetch failed after {attempts} attempts: {reason}"),
                };
            }
            Err(e) => {
                return JobOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let stickers = match self.process_assets(&pack, dirs, cancel).await {
            Ok(stickers) => stickers,
            Err(Error::Cancelled) => return JobOutcome::Cancelled(CancelReason::Requested),
            Err(e) => {
                return JobOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        if stickers.is_empty() {
            return JobOutcome::Failed {
                reason: "no asset survived processing".to_string(),
            };
        }
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled(CancelReason::Requested);
        }

        info!(%pack_id, stickers = stickers.len(), total = pack.assets.len(), "Registering sticker sets");

        match self.register(&pack, stickers, request.split_overflow).await {
            Ok(set_names) => JobOutcome::Completed {
                title: pack.title,
                set_names,
            },
            Err(e) => {
                warn!(%pack_id, error = %e, "Sticker set registration failed");
                JobOutcome::Failed {
                    reason: format!("registration failed: {e}"),
                }
            }
        }
    }
}
