//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use dccon_sticker::domain::{PackId, Sticker, StickerFormat};
use dccon_sticker::jobs::{JobDirs, JobOutcome, JobRequest, JobRunner};
use dccon_sticker::pipeline::AssetProcessor;
use dccon_sticker::source::{FetchedPack, PackAsset, PackSource};
use dccon_sticker::telegram::ChatPlatform;
use dccon_sticker::{Error, Result};

/// Serves `asset_count` assets of 2 KiB each.
pub struct FakeSource {
    pub asset_count: u32,
    pub title: String,
}

impl FakeSource {
    pub fn new(asset_count: u32) -> Self {
        Self {
            asset_count,
            title: "미코콘".to_string(),
        }
    }
}

#[async_trait]
impl PackSource for FakeSource {
    async fn fetch_pack(&self, pack_id: PackId, dest_dir: &Path) -> Result<FetchedPack> {
        let mut assets = Vec::new();
        for ordinal in 1..=self.asset_count {
            let path = dest_dir.join(format!("{ordinal}.png"));
            tokio::fs::write(&path, vec![1u8; 2048]).await?;
            assets.push(PackAsset {
                ordinal,
                source_path: path,
                declared_ext: "png".to_string(),
            });
        }
        Ok(FetchedPack {
            pack_id,
            title: self.title.clone(),
            assets,
        })
    }
}

/// Writes a tiny sticker per asset. Ordinals in `fail` are rejected.
#[derive(Default)]
pub struct FakeProcessor {
    pub fail: HashSet<u32>,
    pub processed: Mutex<Vec<u32>>,
}

#[async_trait]
impl AssetProcessor for FakeProcessor {
    async fn process(
        &self,
        _pack_id: PackId,
        asset: &PackAsset,
        sticker_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Sticker> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.fail.contains(&asset.ordinal) {
            return Err(Error::validation("rate control unsatisfiable"));
        }
        tokio::fs::create_dir_all(sticker_dir).await?;
        let path = sticker_dir.join(format!("{}.webp", asset.ordinal));
        tokio::fs::write(&path, b"sticker").await?;
        self.processed.lock().push(asset.ordinal);
        Ok(Sticker {
            ordinal: asset.ordinal,
            path,
            format: StickerFormat::Static,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Create { name: String, title: String, ordinals: Vec<u32> },
    Add { name: String, ordinal: u32 },
    Message { chat_id: i64, text: String },
}

/// Records every call. Set `reject_create` to make set creation fail.
#[derive(Default)]
pub struct RecordingPlatform {
    pub calls: Mutex<Vec<PlatformCall>>,
    pub reject_create: bool,
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlatformCall::Message { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatPlatform for RecordingPlatform {
    fn bot_username(&self) -> &str {
        "EliteMiko_bot"
    }

    async fn create_sticker_set(&self, name: &str, title: &str, stickers: &[Sticker]) -> Result<()> {
        if self.reject_create {
            return Err(Error::Telegram {
                code: Some(400),
                description: "Bad Request: STICKERSET_INVALID".to_string(),
            });
        }
        self.calls.lock().push(PlatformCall::Create {
            name: name.to_string(),
            title: title.to_string(),
            ordinals: stickers.iter().map(|s| s.ordinal).collect(),
        });
        Ok(())
    }

    async fn add_sticker_to_set(&self, name: &str, sticker: &Sticker) -> Result<()> {
        self.calls.lock().push(PlatformCall::Add {
            name: name.to_string(),
            ordinal: sticker.ordinal,
        });
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.calls.lock().push(PlatformCall::Message {
            chat_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Creates its job directories, then waits for a release permit or cancellation.
pub struct GatedRunner {
    pub gate: Arc<Semaphore>,
}

impl GatedRunner {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl JobRunner for GatedRunner {
    async fn run(&self, request: &JobRequest, dirs: &JobDirs, cancel: &CancellationToken) -> JobOutcome {
        let _ = tokio::fs::create_dir_all(&dirs.source_dir).await;
        let _ = tokio::fs::create_dir_all(&dirs.sticker_dir).await;
        let _ = tokio::fs::write(dirs.sticker_dir.join("1.webp"), b"x").await;

        tokio::select! {
            _ = cancel.cancelled() => JobOutcome::Failed { reason: "interrupted".to_string() },
            permit = self.gate.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
                JobOutcome::Completed {
                    title: "t".to_string(),
                    set_names: vec![format!("abcde{}_by_bot", request.pack_id)],
                }
            }
        }
    }
}
