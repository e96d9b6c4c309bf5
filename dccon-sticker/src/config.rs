//! Runtime configuration loaded from the environment.
//!
//! `.env` files are honoured through `dotenvy` before this is read. All
//! missing required keys are reported together so a misconfigured deployment
//! fails once with the full list.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rate_control::{EncodeTarget, QualityBudget};

use crate::{Error, Result};

pub const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
pub const ENV_OPERATOR_ID: &str = "OPERATOR_ID";
pub const ENV_OPERATOR_NAME: &str = "OPERATOR_NAME";
pub const ENV_WORK_DIR: &str = "WORK_DIR";
pub const ENV_LOG_DIR: &str = "LOG_DIR";
pub const ENV_MAX_CONCURRENT_JOBS: &str = "MAX_CONCURRENT_JOBS";
pub const ENV_FFMPEG_PATH: &str = "FFMPEG_PATH";
pub const ENV_FFPROBE_PATH: &str = "FFPROBE_PATH";
pub const ENV_FFMPEG_HWACCEL: &str = "FFMPEG_HWACCEL";
pub const ENV_UPSCALER_PATH: &str = "UPSCALER_PATH";
pub const ENV_UPSCALE_NOISE: &str = "UPSCALE_NOISE";
pub const ENV_UPSCALE_SCALE: &str = "UPSCALE_SCALE";
pub const ENV_CANCEL_CONFIRM_TIMEOUT_SECS: &str = "CANCEL_CONFIRM_TIMEOUT_SECS";

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_upscale_noise() -> i32 {
    3
}

fn default_upscale_scale() -> u32 {
    2
}

fn default_cancel_confirm_timeout_secs() -> u64 {
    15
}

/// The single user allowed to run privileged commands.
///
/// Sticker sets are also registered under this user's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub id: i64,
    pub name: String,
}

impl Operator {
    /// Both the id and the display name must match.
    pub fn matches(&self, id: i64, name: &str) -> bool {
        self.id == id && normalize_name(&self.name) == normalize_name(name)
    }
}

fn normalize_name(name: &str) -> &str {
    name.trim().trim_start_matches('@')
}

/// External tool locations and upscaling parameters.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Passed to ffmpeg as `-hwaccel <value>` when set.
    pub hwaccel: Option<String>,
    /// waifu2x-style CLI upscaler. The built-in resampler is used when absent.
    pub upscaler_path: Option<PathBuf>,
    pub upscale_noise: i32,
    pub upscale_scale: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            hwaccel: None,
            upscaler_path: None,
            upscale_noise: default_upscale_noise(),
            upscale_scale: default_upscale_scale(),
        }
    }
}

/// Output constraints of the sticker platform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    /// Animated stickers: size, duration and search budget.
    pub video: EncodeTarget,
    /// Static stickers: size ceiling and quality schedule.
    pub still: QualityBudget,
    /// Square canvas every sticker is fitted into.
    pub canvas: u32,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            video: EncodeTarget::default(),
            still: QualityBudget::default(),
            canvas: 512,
        }
    }
}

impl EncodeSettings {
    pub fn max_duration_ms(&self) -> u64 {
        (self.video.max_duration_secs * 1000.0).round() as u64
    }
}

/// Complete bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub bot_token: String,
    pub operator: Operator,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub cancel_confirm_timeout: Duration,
    pub media: MediaConfig,
    pub encode: EncodeSettings,
}

impl BotConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let bot_token = get(ENV_BOT_TOKEN);
        let operator_id = get(ENV_OPERATOR_ID);
        let operator_name = get(ENV_OPERATOR_NAME);
        for (key, value) in [
            (ENV_BOT_TOKEN, &bot_token),
            (ENV_OPERATOR_ID, &operator_id),
            (ENV_OPERATOR_NAME, &operator_name),
        ] {
            if value.is_none() {
                missing.push(key);
            }
        }
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Missing config: {}",
                missing.join(", ")
            )));
        }

        let operator = Operator {
            id: parse_value(ENV_OPERATOR_ID, operator_id.as_deref())?.unwrap_or_default(),
            name: operator_name.unwrap_or_default(),
        };

        let max_concurrent_jobs = parse_value(ENV_MAX_CONCURRENT_JOBS, get(ENV_MAX_CONCURRENT_JOBS).as_deref())?
            .unwrap_or_else(default_max_concurrent_jobs);
        if max_concurrent_jobs == 0 {
            return Err(Error::config(format!("{ENV_MAX_CONCURRENT_JOBS} must be at least 1")));
        }

        let cancel_confirm_timeout_secs = parse_value(
            ENV_CANCEL_CONFIRM_TIMEOUT_SECS,
            get(ENV_CANCEL_CONFIRM_TIMEOUT_SECS).as_deref(),
        )?
        .unwrap_or_else(default_cancel_confirm_timeout_secs);

        let media = MediaConfig {
            ffmpeg_path: get(ENV_FFMPEG_PATH).unwrap_or_else(default_ffmpeg_path),
            ffprobe_path: get(ENV_FFPROBE_PATH).unwrap_or_else(default_ffprobe_path),
            hwaccel: get(ENV_FFMPEG_HWACCEL),
            upscaler_path: get(ENV_UPSCALER_PATH).map(PathBuf::from),
            upscale_noise: parse_value(ENV_UPSCALE_NOISE, get(ENV_UPSCALE_NOISE).as_deref())?
                .unwrap_or_else(default_upscale_noise),
            upscale_scale: parse_value(ENV_UPSCALE_SCALE, get(ENV_UPSCALE_SCALE).as_deref())?
                .unwrap_or_else(default_upscale_scale),
        };

        Ok(Self {
            bot_token: bot_token.unwrap_or_default(),
            operator,
            work_dir: get(ENV_WORK_DIR).map(PathBuf::from).unwrap_or_else(default_work_dir),
            log_dir: get(ENV_LOG_DIR).map(PathBuf::from).unwrap_or_else(default_log_dir),
            max_concurrent_jobs,
            cancel_confirm_timeout: Duration::from_secs(cancel_confirm_timeout_secs),
            media,
            encode: EncodeSettings::default(),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: Option<&str>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{key} has an invalid value: {raw}"))),
    }
}
