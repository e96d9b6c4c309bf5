//! Image upscaling collaborators.
//!
//! Upscalers are synchronous and CPU/GPU bound; callers run them on the
//! blocking pool.

use std::path::{Path, PathBuf};
use std::process::Command;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage, Rgba, RgbaImage};
use tracing::debug;

use crate::config::MediaConfig;
use crate::{Error, Result};

/// Enlarges an opaque RGB image.
pub trait Upscaler: Send + Sync {
    fn upscale(&self, image: &RgbImage) -> Result<RgbImage>;

    fn name(&self) -> &'static str;
}

/// Pure resampling fallback when no model is installed.
#[derive(Debug, Clone, Copy)]
pub struct LanczosUpscaler {
    pub scale: u32,
}

impl Upscaler for LanczosUpscaler {
    fn upscale(&self, image: &RgbImage) -> Result<RgbImage> {
        let scale = self.scale.max(1);
        Ok(imageops::resize(
            image,
            image.width() * scale,
            image.height() * scale,
            FilterType::Lanczos3,
        ))
    }

    fn name(&self) -> &'static str {
        "lanczos"
    }
}

/// Drives a waifu2x-style command line upscaler
/// (`<bin> -i <in> -o <out> -n <noise> -s <scale>`).
#[derive(Debug, Clone)]
pub struct CliUpscaler {
    pub program: PathBuf,
    pub noise: i32,
    pub scale: u32,
}

impl CliUpscaler {
    fn run(&self, input: &Path, output: &Path) -> Result<()> {
        let output_result = Command::new(&self.program)
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .arg("-n")
            .arg(self.noise.to_string())
            .arg("-s")
            .arg(self.scale.to_string())
            .output()
            .map_err(|e| Error::tool(self.program.display().to_string(), None, e.to_string()))?;

        if !output_result.status.success() {
            return Err(Error::tool(
                self.program.display().to_string(),
                output_result.status.code(),
                String::from_utf8_lossy(&output_result.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

impl Upscaler for CliUpscaler {
    fn upscale(&self, image: &RgbImage) -> Result<RgbImage> {
        let scratch = tempfile::Builder::new().prefix("upscale-").tempdir()?;
        let input = scratch.path().join("in.png");
        let output = scratch.path().join("out.png");

        image.save(&input)?;
        self.run(&input, &output)?;
        let result = image::open(&output)?.to_rgb8();

        debug!(
            from = ?image.dimensions(),
            to = ?result.dimensions(),
            "Upscaled with external model"
        );
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "cli"
    }
}

/// Pick the upscaler the configuration asks for.
pub fn from_config(config: &MediaConfig) -> Box<dyn Upscaler> {
    match &config.upscaler_path {
        Some(program) => Box::new(CliUpscaler {
            program: program.clone(),
            noise: config.upscale_noise,
            scale: config.upscale_scale,
        }),
        None => Box::new(LanczosUpscaler {
            scale: config.upscale_scale,
        }),
    }
}

/// Upscale an RGBA image.
///
/// With `has_alpha` the color channels go through the upscaler and the alpha
/// mask is resized bilinearly to the new dimensions, then recombined.
/// Without it the result is fully opaque.
pub fn upscale_rgba(upscaler: &dyn Upscaler, image: &RgbaImage, has_alpha: bool) -> Result<RgbaImage> {
    let rgb = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        image::Rgb([p[0], p[1], p[2]])
    });
    let upscaled = upscaler.upscale(&rgb)?;
    let (width, height) = upscaled.dimensions();

    let alpha = if has_alpha {
        let mask = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            Luma([image.get_pixel(x, y)[3]])
        });
        Some(imageops::resize(&mask, width, height, FilterType::Triangle))
    } else {
        None
    };

    Ok(RgbaImage::from_fn(width, height, |x, y| {
        let p = upscaled.get_pixel(x, y);
        let a = alpha.as_ref().map_or(u8::MAX, |mask| mask.get_pixel(x, y)[0]);
        Rgba([p[0], p[1], p[2], a])
    }))
}
