//! Media collaborators: format sniffing, decoding, upscaling and encoding.

pub mod ffmpeg;
pub mod frames;
pub mod upscaler;

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

pub use frames::AnimatedSequence;
pub use upscaler::{CliUpscaler, LanczosUpscaler, Upscaler};

use crate::{Error, Result};

/// Rename attempts when correcting a wrong extension.
const RENAME_ATTEMPTS: u32 = 3;

/// A decoded asset: one still image or a frame sequence.
#[derive(Debug, Clone)]
pub enum DecodedAsset {
    Static(DynamicImage),
    Animated(AnimatedSequence),
}

/// A source file whose extension matches its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffedFile {
    pub path: PathBuf,
    pub format: ImageFormat,
    pub ext: String,
}

fn canonical_ext(format: ImageFormat) -> String {
    format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("bin")
        .to_string()
}

/// Sniff the real format of `path` and rename the file if its extension lies.
pub async fn sniff_and_rename(path: &Path) -> Result<SniffedFile> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::io_path("reading", path, e))?;
    let format = image::guess_format(&bytes)?;

    let declared = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension);
    if declared == Some(format) {
        return Ok(SniffedFile {
            path: path.to_path_buf(),
            format,
            ext: path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
        });
    }

    let ext = canonical_ext(format);
    let target = path.with_extension(&ext);
    debug!(from = %path.display(), to = %target.display(), "Correcting file extension");

    let mut last_err = None;
    for attempt in 1..=RENAME_ATTEMPTS {
        match tokio::fs::rename(path, &target).await {
            Ok(()) => {
                return Ok(SniffedFile {
                    path: target,
                    format,
                    ext,
                });
            }
            Err(e) => {
                warn!(path = %path.display(), attempt, error = %e, "Rename failed");
                last_err = Some(e);
            }
        }
    }

    Err(Error::io_path(
        "renaming",
        path,
        last_err.unwrap_or_else(|| std::io::Error::other("rename failed")),
    ))
}

/// Decode a sniffed file into its tagged form.
///
/// GIFs with more than one frame are animated. Everything else, single-frame
/// GIFs included, is static.
pub fn decode_asset(bytes: &[u8], format: ImageFormat) -> Result<DecodedAsset> {
    if format == ImageFormat::Gif {
        let sequence = frames::decode_gif(bytes)?;
        if sequence.frames.len() > 1 {
            return Ok(DecodedAsset::Animated(sequence));
        }
    }
    Ok(DecodedAsset::Static(image::load_from_memory_with_format(
        bytes, format,
    )?))
}
