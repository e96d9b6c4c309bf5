//! Source-pack fetching and download validation.
//!
//! A [`PackSource`] performs a single fetch attempt. [`fetch_validated`]
//! wraps it with the size checks and the bounded retry loop.

mod dccon;

pub use dccon::DcconSource;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::domain::PackId;
use crate::utils::fs;

/// Downloads smaller than this are the host's placeholder for unknown ids.
pub const PLACEHOLDER_MAX_BYTES: u64 = 1024;

/// Fetch attempts before giving up.
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// One asset as listed by the pack metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackAsset {
    /// 1-based position in the pack.
    pub ordinal: u32,
    pub source_path: PathBuf,
    /// Extension claimed by the host. May be wrong.
    pub declared_ext: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPack {
    pub pack_id: PackId,
    pub title: String,
    pub assets: Vec<PackAsset>,
}

/// A remote pack host.
///
/// Implementations must be idempotent per `(pack_id, dest_dir)`.
#[async_trait]
pub trait PackSource: Send + Sync {
    async fn fetch_pack(&self, pack_id: PackId, dest_dir: &Path) -> Result<FetchedPack>;
}

/// Result of a validated fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedPack),
    ExhaustedRetries { attempts: u32, reason: String },
    Cancelled,
}

/// Why a downloaded pack was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    Empty,
    Missing { ordinal: u32 },
    DownloadFailed { ordinal: u32 },
    WrongPackId { ordinal: u32 },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "pack has no assets"),
            Self::Missing { ordinal } => write!(f, "asset {ordinal} was not downloaded"),
            Self::DownloadFailed { ordinal } => write!(f, "asset {ordinal} download failed"),
            Self::WrongPackId { ordinal } => {
                write!(f, "asset {ordinal} is a placeholder, wrong pack id")
            }
        }
    }
}

/// Check every listed asset on disk.
pub async fn validate_download(pack: &FetchedPack) -> std::result::Result<(), ValidationFailure> {
    if pack.assets.is_empty() {
        return Err(ValidationFailure::Empty);
    }

    for asset in &pack.assets {
        let size = match tokio::fs::metadata(&asset.source_path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(ValidationFailure::Missing {
                    ordinal: asset.ordinal,
                });
            }
        };
        if size == 0 {
            return Err(ValidationFailure::DownloadFailed {
                ordinal: asset.ordinal,
            });
        }
        if size <= PLACEHOLDER_MAX_BYTES {
            return Err(ValidationFailure::WrongPackId {
                ordinal: asset.ordinal,
            });
        }
    }

    Ok(())
}

/// Fetch `pack_id` into `dest_dir`, retrying on failed validation.
///
/// `dest_dir` is wiped between attempts. Cancellation is observed before
/// each attempt.
pub async fn fetch_validated(
    source: &dyn PackSource,
    pack_id: PackId,
    dest_dir: &Path,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<FetchOutcome> {
    let mut reason = String::from("no attempt made");

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }

        fs::ensure_dir_all(dest_dir).await?;

        match source.fetch_pack(pack_id, dest_dir).await {
            Ok(pack) => match validate_download(&pack).await {
                Ok(()) => {
                    info!(%pack_id, attempt, assets = pack.assets.len(), "Pack fetched");
                    return Ok(FetchOutcome::Fetched(pack));
                }
                Err(failure) => reason = failure.to_string(),
            },
            Err(e) => reason = e.to_string(),
        }

        warn!(%pack_id, attempt, max_attempts, %reason, "Pack fetch attempt failed");
        fs::delete_tree(dest_dir).await;
    }

    Ok(FetchOutcome::ExhaustedRetries {
        attempts: max_attempts,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Writes `sizes[attempt]` bytes per asset on each successive call.
    struct ScriptedSource {
        sizes: Vec<usize>,
        assets: u32,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl PackSource for ScriptedSource {
        async fn fetch_pack(&self, pack_id: PackId, dest_dir: &Path) -> Result<FetchedPack> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls - 1
            };
            let size = self.sizes[call.min(self.sizes.len() - 1)];
            let mut assets = Vec::new();
            for ordinal in 1..=self.assets {
                let path = dest_dir.join(format!("{ordinal}.png"));
                tokio::fs::write(&path, vec![7u8; size]).await?;
                assets.push(PackAsset {
                    ordinal,
                    source_path: path,
                    declared_ext: "png".to_string(),
                });
            }
            Ok(FetchedPack {
                pack_id,
                title: "test".to_string(),
                assets,
            })
        }
    }

    #[tokio::test]
    async fn test_retries_after_zero_byte_download() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("img/1");
        let source = ScriptedSource {
            sizes: vec![0, 4096],
            assets: 3,
            calls: Mutex::new(0),
        };

        let outcome = fetch_validated(&source, PackId(1), &dest, 3, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fetched(pack) => assert_eq!(pack.assets.len(), 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(*source.calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_exhausts_retries() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("img/2");
        let source = ScriptedSource {
            sizes: vec![512],
            assets: 2,
            calls: Mutex::new(0),
        };

        let outcome = fetch_validated(&source, PackId(2), &dest, 3, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            FetchOutcome::ExhaustedRetries { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("wrong pack id"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(*source.calls.lock(), 3);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource {
            sizes: vec![4096],
            assets: 1,
            calls: Mutex::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fetch_validated(&source, PackId(3), dir.path(), 3, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Cancelled));
        assert_eq!(*source.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_validation() {
        let pack = FetchedPack {
            pack_id: PackId(4),
            title: String::new(),
            assets: vec![PackAsset {
                ordinal: 1,
                source_path: PathBuf::from("/nonexistent/1.png"),
                declared_ext: "png".to_string(),
            }],
        };
        assert_eq!(
            validate_download(&pack).await,
            Err(ValidationFailure::Missing { ordinal: 1 })
        );
    }
}
