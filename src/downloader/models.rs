// Common data models for downloader

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DownloadError;

/// Video quality labels offered in the format menu, highest first
pub const QUALITY_LABELS: [&str; 6] = ["2160p", "1440p", "1080p", "720p", "480p", "360p"];

/// What the user asked for: an MP3, or an MP4 at a given quality label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Audio,
    Video(String),
}

impl OutputFormat {
    /// Extension of the file this format produces
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video(_) => "mp4",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase();
        match tag.as_str() {
            "mp3" | "audio" => Ok(Self::Audio),
            label if QUALITY_LABELS.contains(&label) => Ok(Self::Video(label.to_string())),
            _ => Err(DownloadError::InvalidFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "mp3"),
            Self::Video(label) => write!(f, "{}", label),
        }
    }
}

/// One selectable stream of an item, as reported by the resolver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamFormat {
    /// Format ID / itag (e.g., "137", "140")
    pub format_id: String,
    /// Container extension (mp4, webm, m4a)
    pub ext: String,
    /// Quality label (e.g., "1080p60"); None for audio-only streams
    pub quality_label: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    /// Video codec (avc1, vp9, av01, none)
    pub vcodec: Option<String>,
    /// Audio codec (mp4a, opus, none)
    pub acodec: Option<String>,
    /// Audio bitrate in kbps
    pub abr: Option<f32>,
    /// Total bitrate in kbps
    pub tbr: Option<f32>,
    pub filesize: Option<u64>,
    /// Direct media URL, when the platform exposes one
    pub url: Option<String>,
    /// Transfer protocol reported by yt-dlp (https, m3u8_native, ...)
    pub protocol: Option<String>,
    /// Headers required to fetch `url`
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl StreamFormat {
    pub fn has_video(&self) -> bool {
        self.vcodec
            .as_deref()
            .map_or(false, |v| v != "none" && !v.is_empty())
    }

    pub fn has_audio(&self) -> bool {
        self.acodec
            .as_deref()
            .map_or(false, |a| a != "none" && !a.is_empty())
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    /// Whether the bytes can be pulled with a plain HTTP GET
    pub fn is_direct_http(&self) -> bool {
        self.url.is_some()
            && self
                .protocol
                .as_deref()
                .map_or(true, |p| p == "https" || p == "http")
    }
}

/// Item metadata produced by the resolver; read-only to the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub source_url: String,
    pub id: String,
    pub title: String,
    pub uploader: String,
    pub duration_seconds: u64,
    pub formats: Vec<StreamFormat>,
}

/// Ordered playlist entries plus the playlist title
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub entries: Vec<String>,
}

/// One download action from the user
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: OutputFormat,
    pub destination: PathBuf,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, format: OutputFormat, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            format,
            destination: destination.into(),
        }
    }
}

/// Result of a playlist run, one entry per playlist item
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaylistSummary {
    pub title: String,
    pub directory: PathBuf,
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
}

impl PlaylistSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What a `download` action ended up producing
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DownloadOutcome {
    Item { path: PathBuf },
    Playlist(PlaylistSummary),
}
