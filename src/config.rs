// Application settings from `~/.config/tubefetch/config.toml`

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::downloader::backends::ffmpeg::DEFAULT_TIMEOUT;
use crate::downloader::item::FadeTiming;
use crate::downloader::models::OutputFormat;

/// Every key is optional; missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where items and playlist folders are written (default: the user's Downloads)
    pub download_dir: Option<PathBuf>,
    /// Explicit yt-dlp binary; otherwise searched for
    pub ytdlp_path: Option<String>,
    /// Explicit ffmpeg binary; otherwise searched for
    pub ffmpeg_path: Option<String>,
    pub audio_bitrate_kbps: u32,
    /// Upper bound for one encode or mux before ffmpeg is killed
    pub transcode_timeout_secs: u64,
    /// Upper bound for one metadata call
    pub resolve_timeout_secs: u64,
    /// Finished indicators stay this long before fading
    pub fade_delay_secs: f64,
    pub fade_secs: f64,
    /// Wait after the last indicator is gone before hiding the container
    pub hide_check_secs: f64,
    /// SOCKS5/HTTP proxy for yt-dlp and stream requests
    pub proxy: Option<String>,
    /// cookies.txt handed to yt-dlp
    pub cookies_path: Option<String>,
    /// Format used when none is given on the command line
    pub default_quality: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            ytdlp_path: None,
            ffmpeg_path: None,
            audio_bitrate_kbps: 128,
            transcode_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            resolve_timeout_secs: 60,
            fade_delay_secs: 1.5,
            fade_secs: 2.0,
            hide_check_secs: 5.0,
            proxy: None,
            cookies_path: None,
            default_quality: "720p".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from the default location; no file means defaults.
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::warn!("no config directory on this platform, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: AppConfig =
            toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        tracing::info!("loaded config from {}", path.display());
        Ok(cfg)
    }

    /// Configured download directory, else Downloads, else home, else cwd
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn default_format(&self) -> Result<OutputFormat> {
        self.default_quality
            .parse()
            .with_context(|| format!("default_quality in config ({})", self.default_quality))
    }

    pub fn fade_timing(&self) -> FadeTiming {
        FadeTiming {
            delay: secs(self.fade_delay_secs),
            fade: secs(self.fade_secs),
        }
    }

    pub fn hide_check(&self) -> Duration {
        secs(self.hide_check_secs)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }
}

/// Non-finite or negative values in the file count as zero
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// `<config dir>/tubefetch/config.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tubefetch").join("config.toml"))
}
