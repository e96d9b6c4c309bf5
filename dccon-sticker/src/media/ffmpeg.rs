//! ffmpeg / ffprobe invocations for sticker encoding.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rate_control::{BitrateEncoder, EncodeError, QualityEncoder};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::MediaConfig;
use crate::utils::{fs, process};
use crate::{Error, Result};

/// Manifest file name written next to extracted frames.
pub const CONCAT_MANIFEST: &str = "frames.ffconcat";

/// Locations and flags for the ffmpeg tool pair.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub hwaccel: Option<String>,
}

impl FfmpegTools {
    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            hwaccel: config.hwaccel.clone(),
        }
    }

    fn ffmpeg_command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "warning", "-y"]);
        if let Some(hwaccel) = &self.hwaccel {
            cmd.args(["-hwaccel", hwaccel]);
        }
        cmd
    }

    /// Rendered duration of a concat manifest, in seconds.
    pub async fn probe_duration(&self, manifest: &Path, cancel: &CancellationToken) -> Result<f64> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(manifest)
            .args([
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ]);

        let output = process::run_tool("ffprobe", &mut cmd, cancel).await?;
        parse_duration(&output.stdout)
    }
}

fn parse_duration(stdout: &str) -> Result<f64> {
    let raw = stdout.trim();
    match raw.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
        _ => Err(Error::validation(format!("ffprobe returned no duration: {raw:?}"))),
    }
}

/// Write an ffconcat manifest listing `frames` with their display durations.
///
/// The last frame is listed twice so the demuxer honours its duration.
pub async fn write_concat_manifest(
    dir: &Path,
    frames: &[PathBuf],
    durations_ms: &[u32],
) -> Result<PathBuf> {
    let manifest = dir.join(CONCAT_MANIFEST);
    tokio::fs::write(&manifest, render_concat_manifest(frames, durations_ms))
        .await
        .map_err(|e| fs::io_error("writing concat manifest", &manifest, e))?;
    Ok(manifest)
}

fn render_concat_manifest(frames: &[PathBuf], durations_ms: &[u32]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for (frame, duration) in frames.iter().zip(durations_ms) {
        let name = frame
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _ = writeln!(out, "file '{}'", name.replace('\'', "'\\''"));
        let _ = writeln!(out, "duration {:.3}", f64::from(*duration) / 1000.0);
    }
    if let Some(last) = frames.last().and_then(|f| f.file_name()) {
        let _ = writeln!(out, "file '{}'", last.to_string_lossy().replace('\'', "'\\''"));
    }
    out
}

/// ffmpeg runs at `-loglevel warning`, so anything on stderr is worth a line.
fn log_tool_warnings(run: &process::ToolOutput) {
    let stderr = run.stderr.trim();
    if !stderr.is_empty() {
        debug!(stderr, "ffmpeg reported warnings");
    }
}

/// Encodes a frame sequence to VP9 WebM at a requested bitrate.
pub struct VideoEncoder {
    pub tools: FfmpegTools,
    pub manifest: PathBuf,
    pub output: PathBuf,
    pub has_alpha: bool,
    pub canvas: u32,
    pub cancel: CancellationToken,
}

impl VideoEncoder {
    fn filter(&self, speed_factor: f64) -> String {
        let pix_fmt = self.pixel_format();
        format!(
            "setpts={:.6}*PTS,scale={c}:{c}:force_original_aspect_ratio=decrease,format={pix_fmt}",
            1.0 / speed_factor,
            c = self.canvas,
        )
    }

    fn pixel_format(&self) -> &'static str {
        if self.has_alpha { "yuva420p" } else { "yuv420p" }
    }

    fn command(&self, bitrate_kbps: u32, speed_factor: f64) -> Command {
        let mut cmd = self.tools.ffmpeg_command();
        cmd.args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&self.manifest)
            .arg("-filter:v")
            .arg(self.filter(speed_factor))
            .args(["-c:v", "libvpx-vp9"])
            .arg("-b:v")
            .arg(format!("{bitrate_kbps}k"))
            .args(["-pix_fmt", self.pixel_format(), "-an", "-sn"])
            .arg(&self.output);
        cmd
    }

    async fn encode_once(&self, bitrate_kbps: u32, speed_factor: f64) -> Result<u64> {
        let mut cmd = self.command(bitrate_kbps, speed_factor);
        let run = process::run_tool("ffmpeg", &mut cmd, &self.cancel).await?;
        log_tool_warnings(&run);
        let size = fs::file_size(&self.output).await?;
        debug!(
            output = %self.output.display(),
            bitrate_kbps,
            size,
            elapsed_secs = run.duration,
            "Encoded video attempt"
        );
        Ok(size)
    }
}

#[async_trait]
impl BitrateEncoder for VideoEncoder {
    async fn encode(&self, bitrate_kbps: u32, speed_factor: f64) -> std::result::Result<u64, EncodeError> {
        self.encode_once(bitrate_kbps, speed_factor)
            .await
            .map_err(EncodeError::encoder)
    }
}

/// Re-encodes a still image to lossy WebP at a requested quality.
pub struct StillEncoder {
    pub tools: FfmpegTools,
    pub input: PathBuf,
    pub output: PathBuf,
    pub cancel: CancellationToken,
}

impl StillEncoder {
    async fn encode_once(&self, quality: u8) -> Result<u64> {
        let mut cmd = self.tools.ffmpeg_command();
        cmd.arg("-i")
            .arg(&self.input)
            .args(["-c:v", "libwebp", "-quality"])
            .arg(quality.to_string())
            .arg(&self.output);
        let run = process::run_tool("ffmpeg", &mut cmd, &self.cancel).await?;
        log_tool_warnings(&run);
        let size = fs::file_size(&self.output).await?;
        debug!(output = %self.output.display(), quality, size, elapsed_secs = run.duration, "Encoded still attempt");
        Ok(size)
    }
}

#[async_trait]
impl QualityEncoder for StillEncoder {
    async fn encode(&self, quality: u8) -> std::result::Result<u64, EncodeError> {
        self.encode_once(quality).await.map_err(EncodeError::encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(has_alpha: bool) -> VideoEncoder {
        VideoEncoder {
            tools: FfmpegTools::from_config(&MediaConfig::default()),
            manifest: PathBuf::from("frames.ffconcat"),
            output: PathBuf::from("1.webm"),
            has_alpha,
            canvas: 512,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_manifest_repeats_last_frame() {
        let frames = vec![PathBuf::from("/x/000.png"), PathBuf::from("/x/001.png")];
        let manifest = render_concat_manifest(&frames, &[60, 40]);
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ffconcat version 1.0",
                "file '000.png'",
                "duration 0.060",
                "file '001.png'",
                "duration 0.040",
                "file '001.png'",
            ]
        );
    }

    #[test]
    fn test_filter_time_compresses_and_fits_canvas() {
        let filter = encoder(true).filter(2.0);
        assert!(filter.starts_with("setpts=0.500000*PTS"));
        assert!(filter.contains("scale=512:512:force_original_aspect_ratio=decrease"));
        assert!(filter.ends_with("format=yuva420p"));
        assert!(encoder(false).filter(1.0).ends_with("format=yuv420p"));
    }

    #[test]
    fn test_command_carries_bitrate_and_strips_streams() {
        let cmd = encoder(false).command(682, 1.0);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["-b:v", "682k"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx-vp9"]));
        assert!(args.contains(&"-an".to_string()));
        assert!(args.contains(&"-sn".to_string()));
        assert!(!args.contains(&"-hwaccel".to_string()));
    }

    #[test]
    fn test_hwaccel_flag_added() {
        let mut enc = encoder(false);
        enc.tools.hwaccel = Some("cuda".to_string());
        let args: Vec<String> = enc
            .command(100, 1.0)
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["-hwaccel", "cuda"]));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3.000000\n").unwrap(), 3.0);
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("").is_err());
    }
}
