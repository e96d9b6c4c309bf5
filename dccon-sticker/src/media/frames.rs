//! Animated sequence decoding and frame timing.

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, RgbaImage};

use crate::Result;

/// Delay browsers substitute for a zero GIF frame delay.
pub const ZERO_DELAY_FALLBACK_MS: u32 = 100;

/// Decoded frames of an animation with their display durations.
#[derive(Debug, Clone)]
pub struct AnimatedSequence {
    pub frames: Vec<RgbaImage>,
    pub durations_ms: Vec<u32>,
    pub has_alpha: bool,
}

impl AnimatedSequence {
    pub fn total_duration_ms(&self) -> u64 {
        self.durations_ms.iter().map(|&d| u64::from(d)).sum()
    }
}

/// Decode every frame of a GIF. Frames come back composited to full canvas.
pub fn decode_gif(bytes: &[u8]) -> Result<AnimatedSequence> {
    let decoder = GifDecoder::new(Cursor::new(bytes))?;
    let frames = decoder.into_frames().collect_frames()?;

    let mut durations_ms = Vec::with_capacity(frames.len());
    let mut images = Vec::with_capacity(frames.len());
    for frame in frames {
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay = if denom == 0 { 0 } else { numer / denom };
        durations_ms.push(delay);
        images.push(frame.into_buffer());
    }

    let has_alpha = images.iter().any(has_transparency);

    Ok(AnimatedSequence {
        frames: images,
        durations_ms: normalize_durations(&durations_ms),
        has_alpha,
    })
}

/// Whether any pixel is not fully opaque.
pub fn has_transparency(image: &RgbaImage) -> bool {
    image.pixels().any(|p| p[3] < u8::MAX)
}

/// Replace zero delays with [`ZERO_DELAY_FALLBACK_MS`].
pub fn normalize_durations(durations_ms: &[u32]) -> Vec<u32> {
    durations_ms
        .iter()
        .map(|&d| if d == 0 { ZERO_DELAY_FALLBACK_MS } else { d })
        .collect()
}

/// Scale durations uniformly so they sum to exactly `max_total_ms`.
///
/// Returns the input unchanged when it already fits. Rounding leftovers go to
/// the frames with the largest fractional parts, earliest first on ties.
pub fn scale_durations(durations_ms: &[u32], max_total_ms: u64) -> Vec<u32> {
    let total: u64 = durations_ms.iter().map(|&d| u64::from(d)).sum();
    if total <= max_total_ms || total == 0 {
        return durations_ms.to_vec();
    }

    let mut scaled = Vec::with_capacity(durations_ms.len());
    let mut remainders = Vec::with_capacity(durations_ms.len());
    for (idx, &d) in durations_ms.iter().enumerate() {
        let numer = u64::from(d) * max_total_ms;
        scaled.push(numer / total);
        remainders.push((numer % total, idx));
    }

    let assigned: u64 = scaled.iter().sum();
    let mut leftover = max_total_ms - assigned;
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, idx) in remainders {
        if leftover == 0 {
            break;
        }
        scaled[idx] += 1;
        leftover -= 1;
    }

    scaled.into_iter().map(|d| d as u32).collect()
}
