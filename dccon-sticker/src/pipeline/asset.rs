use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use image::DynamicImage;
use image::imageops::FilterType;
use rate_control::{QualityOutcome, RateController, RateOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AssetProcessor;
use crate::config::EncodeSettings;
use crate::domain::{PackId, Sticker, StickerFormat};
use crate::media::ffmpeg::{self, FfmpegTools, StillEncoder, VideoEncoder};
use crate::media::{self, AnimatedSequence, DecodedAsset, Upscaler, frames, upscaler};
use crate::source::PackAsset;
use crate::utils::fs;
use crate::{Error, Result};

/// The production asset pipeline.
pub struct AssetPipeline {
    tools: FfmpegTools,
    upscaler: Arc<dyn Upscaler>,
    settings: EncodeSettings,
    /// Frames upscaled at once per animated asset.
    frame_parallelism: usize,
}

impl AssetPipeline {
    pub fn new(tools: FfmpegTools, upscaler: Arc<dyn Upscaler>, settings: EncodeSettings) -> Self {
        let frame_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            tools,
            upscaler,
            settings,
            frame_parallelism,
        }
    }

    async fn process_static(
        &self,
        ordinal: u32,
        image: DynamicImage,
        sticker_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Sticker> {
        let png_path = sticker_dir.join(format!("{ordinal}.png"));
        let upscaler = self.upscaler.clone();
        let canvas = self.settings.canvas;
        let target = png_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let rgba = image.to_rgba8();
            let has_alpha = frames::has_transparency(&rgba);
            let upscaled = upscaler::upscale_rgba(upscaler.as_ref(), &rgba, has_alpha)?;
            let fitted = DynamicImage::ImageRgba8(upscaled).resize(canvas, canvas, FilterType::Lanczos3);
            fitted.save(&target)?;
            Ok(())
        })
        .await??;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let initial_size = fs::file_size(&png_path).await?;
        let webp_path = sticker_dir.join(format!("{ordinal}.webp"));
        let encoder = StillEncoder {
            tools: self.tools.clone(),
            input: png_path.clone(),
            output: webp_path.clone(),
            cancel: cancel.clone(),
        };

        let outcome = match self.settings.still.run(&encoder, initial_size, cancel).await {
            Ok(outcome) => outcome,
            Err(_) if cancel.is_cancelled() => return Err(Error::Cancelled),
            Err(e) => return Err(e.into()),
        };

        match outcome {
            QualityOutcome::WithinBudget { quality: None, size_bytes } => {
                debug!(ordinal, size_bytes, "Static sticker within budget");
                Ok(Sticker {
                    ordinal,
                    path: png_path,
                    format: StickerFormat::Static,
                })
            }
            QualityOutcome::WithinBudget { quality: Some(quality), size_bytes } => {
                debug!(ordinal, quality, size_bytes, "Static sticker re-encoded");
                Ok(Sticker {
                    ordinal,
                    path: webp_path,
                    format: StickerFormat::Static,
                })
            }
            QualityOutcome::Unsatisfiable { last_size_bytes } => Err(Error::validation(format!(
                "image still {last_size_bytes} bytes at lowest quality"
            ))),
            QualityOutcome::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Upscale every frame concurrently and write `NNN.png` files in order.
    async fn upscale_frames(
        &self,
        sequence: AnimatedSequence,
        frame_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let has_alpha = sequence.has_alpha;
        let tasks = sequence.frames.into_iter().enumerate().map(|(idx, frame)| {
            let upscaler = self.upscaler.clone();
            let path = frame_dir.join(format!("{idx:03}.png"));
            async move {
                tokio::task::spawn_blocking(move || -> Result<PathBuf> {
                    let upscaled = upscaler::upscale_rgba(upscaler.as_ref(), &frame, has_alpha)?;
                    upscaled.save(&path)?;
                    Ok(path)
                })
                .await?
            }
        });

        stream::iter(tasks)
            .buffered(self.frame_parallelism)
            .try_collect()
            .await
    }

    async fn process_animated(
        &self,
        pack_id: PackId,
        ordinal: u32,
        sequence: AnimatedSequence,
        sticker_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Sticker> {
        let frame_dir = sticker_dir.join(format!("{pack_id}_{ordinal}"));
        fs::ensure_dir_all(&frame_dir).await?;

        let has_alpha = sequence.has_alpha;
        let frame_count = sequence.frames.len();
        let durations = frames::scale_durations(&sequence.durations_ms, self.settings.max_duration_ms());
        let frame_paths = self.upscale_frames(sequence, &frame_dir).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let manifest = ffmpeg::write_concat_manifest(&frame_dir, &frame_paths, &durations).await?;
        let fallback_secs = durations.iter().map(|&d| f64::from(d)).sum::<f64>() / 1000.0;
        let duration_secs = match self.tools.probe_duration(&manifest, cancel).await {
            Ok(secs) => secs,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(%pack_id, ordinal, error = %e, fallback_secs, "Duration probe failed, using frame timings");
                fallback_secs
            }
        };

        let output = sticker_dir.join(format!("{ordinal}.webm"));
        let encoder = VideoEncoder {
            tools: self.tools.clone(),
            manifest,
            output: output.clone(),
            has_alpha,
            canvas: self.settings.canvas,
            cancel: cancel.clone(),
        };

        let run = match RateController::new(self.settings.video)
            .run(&encoder, duration_secs, cancel)
            .await
        {
            Ok(run) => run,
            Err(_) if cancel.is_cancelled() => return Err(Error::Cancelled),
            Err(e) => return Err(e.into()),
        };

        fs::delete_tree(&frame_dir).await;

        for attempt in &run.attempts {
            debug!(
                %pack_id,
                ordinal,
                attempt = attempt.attempt_index,
                bitrate_kbps = attempt.bitrate_kbps,
                size_bytes = attempt.produced_size_bytes,
                "Encode attempt"
            );
        }

        match run.outcome {
            RateOutcome::Converged {
                bitrate_kbps,
                size_bytes,
                counted_attempts,
            } => {
                info!(
                    %pack_id,
                    ordinal,
                    frame_count,
                    bitrate_kbps,
                    size_bytes,
                    attempts = run.attempts.len(),
                    counted_attempts,
                    "Animated sticker encoded"
                );
                Ok(Sticker {
                    ordinal,
                    path: output,
                    format: StickerFormat::Video,
                })
            }
            RateOutcome::Unsatisfiable { last_bitrate_kbps } => Err(Error::validation(format!(
                "no positive bitrate fits the size budget (last {last_bitrate_kbps} kbps)"
            ))),
            RateOutcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

#[async_trait]
impl AssetProcessor for AssetPipeline {
    async fn process(
        &self,
        pack_id: PackId,
        asset: &PackAsset,
        sticker_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Sticker> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let sniffed = media::sniff_and_rename(&asset.source_path).await?;
        if sniffed.ext != asset.declared_ext {
            debug!(%pack_id, ordinal = asset.ordinal, declared = %asset.declared_ext, actual = %sniffed.ext, "Declared extension corrected");
        }

        let bytes = tokio::fs::read(&sniffed.path)
            .await
            .map_err(|e| fs::io_error("reading", &sniffed.path, e))?;
        let format = sniffed.format;
        let decoded = tokio::task::spawn_blocking(move || media::decode_asset(&bytes, format)).await??;

        fs::ensure_dir_all(sticker_dir).await?;

        match decoded {
            DecodedAsset::Static(image) => {
                self.process_static(asset.ordinal, image, sticker_dir, cancel)
                    .await
            }
            DecodedAsset::Animated(sequence) => {
                self.process_animated(pack_id, asset.ordinal, sequence, sticker_dir, cancel)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use image::{ImageFormat, Rgba, RgbaImage};
    use tempfile::TempDir;

    fn pipeline() -> AssetPipeline {
        AssetPipeline::new(
            FfmpegTools::from_config(&MediaConfig::default()),
            Arc::new(media::LanczosUpscaler { scale: 2 }),
            EncodeSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_small_static_asset_becomes_png_sticker() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("1.gif");
        // A PNG with a lying extension.
        RgbaImage::from_pixel(64, 32, Rgba([10, 200, 30, 255]))
            .save_with_format(&source, ImageFormat::Png)
            .unwrap();
        let asset = PackAsset {
            ordinal: 1,
            source_path: source,
            declared_ext: "gif".to_string(),
        };
        let sticker_dir = dir.path().join("sticker");

        let sticker = pipeline()
            .process(PackId(5), &asset, &sticker_dir, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sticker.format, StickerFormat::Static);
        assert_eq!(sticker.path, sticker_dir.join("1.png"));
        let written = image::open(&sticker.path).unwrap();
        assert_eq!(written.width(), 512);
        assert_eq!(written.height(), 256);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let asset = PackAsset {
            ordinal: 1,
            source_path: dir.path().join("1.png"),
            declared_ext: "png".to_string(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline()
            .process(PackId(5), &asset, dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_upscale_frames_written_in_order() {
        let dir = TempDir::new().unwrap();
        let sequence = AnimatedSequence {
            frames: (0..5u8)
                .map(|i| RgbaImage::from_pixel(4, 4, Rgba([i * 40, 0, 0, 255])))
                .collect(),
            durations_ms: vec![100; 5],
            has_alpha: false,
        };

        let paths = pipeline().upscale_frames(sequence, dir.path()).await.unwrap();

        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["000.png", "001.png", "002.png", "003.png", "004.png"]);
        assert_eq!(image::open(&paths[4]).unwrap().width(), 8);
    }
}
