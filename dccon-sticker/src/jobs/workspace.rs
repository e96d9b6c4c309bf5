//! Per-job working directories.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::Result;
use crate::domain::PackId;
use crate::utils::fs;

/// Root directories shared by every job.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    source_root: PathBuf,
    sticker_root: PathBuf,
}

/// Directories owned by a single job, namespaced by pack id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirs {
    /// Fetched source assets.
    pub source_dir: PathBuf,
    /// Upscaled frames and finished stickers.
    pub sticker_dir: PathBuf,
}

impl WorkDirs {
    /// `<work_dir>/img` for sources, `<work_dir>/sticker` for outputs.
    pub fn new(work_dir: &Path) -> Self {
        Self {
            source_root: work_dir.join("img"),
            sticker_root: work_dir.join("sticker"),
        }
    }

    pub fn for_pack(&self, pack_id: PackId) -> JobDirs {
        JobDirs {
            source_dir: self.source_root.join(pack_id.to_string()),
            sticker_dir: self.sticker_root.join(pack_id.to_string()),
        }
    }

    /// Wipe and recreate both roots. Leftovers of a crashed run go away here.
    pub async fn prepare(&self) -> Result<()> {
        fs::reset_dir(&self.source_root).await?;
        fs::reset_dir(&self.sticker_root).await?;
        info!(
            source = %self.source_root.display(),
            sticker = %self.sticker_root.display(),
            "Working directories ready"
        );
        Ok(())
    }
}

impl JobDirs {
    /// Best-effort removal of both directories.
    pub async fn delete_all(&self) {
        fs::delete_tree(&self.source_dir).await;
        fs::delete_tree(&self.sticker_dir).await;
    }

    pub fn exists(&self) -> bool {
        self.source_dir.exists() || self.sticker_dir.exists()
    }
}
