// Error types for the download pipeline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The URL does not point at a real/accessible item
    #[error("Could not resolve {url}: {reason}")]
    Resolve { url: String, reason: String },

    /// Playlist is missing or private
    #[error("This playlist either does not exist or is private: {0}")]
    PlaylistUnavailable(String),

    /// No stream matches the requested quality label (or no audio stream at all)
    #[error("No {quality} stream available for \"{title}\"")]
    NoMatchingStream { quality: String, title: String },

    /// yt-dlp or ffmpeg not found in system
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Network timeout while talking to the platform
    #[error("Network timeout: the platform is not responding")]
    NetworkTimeout,

    /// Platform throttled or blocked the request (429, bot detection, ...)
    #[error("The platform is throttling requests from this network, try again later or use a proxy")]
    Blocked,

    /// A media byte stream could not be opened or broke mid-transfer
    #[error("Stream error: {0}")]
    Stream(String),

    /// The external transcoder exited with an error
    #[error("ffmpeg failed: {0}")]
    Transcode(String),

    /// The external transcoder did not finish within the allowed time
    #[error("ffmpeg did not finish within {0}s and was stopped")]
    Timeout(u64),

    #[error("Download cancelled")]
    Cancelled,

    /// Unknown output format tag
    #[error("Unsupported format \"{0}\" (expected mp3, audio or one of 2160p, 1440p, 1080p, 720p, 480p, 360p)")]
    InvalidFormat(String),

    /// Failed to parse tool output
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything yt-dlp reported that we could not classify
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DownloadError {
    /// Build a resolution error from raw tool output, keeping the more specific
    /// classification when the message reveals one.
    pub fn resolve(url: &str, stderr: &str) -> Self {
        match Self::from(stderr.to_string()) {
            Self::Unknown(reason) | Self::Parse(reason) => Self::Resolve {
                url: url.to_string(),
                reason: first_error_line(&reason),
            },
            Self::Resolve { reason, .. } => Self::Resolve {
                url: url.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// yt-dlp prints a lot of noise; keep the first `ERROR:` line when there is one.
fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| stderr.lines().map(str::trim).rev().find(|l| !l.is_empty()))
        .unwrap_or("no output")
        .to_string()
}

// Classify raw tool stderr
impl From<String> for DownloadError {
    fn from(s: String) -> Self {
        let lower = s.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") {
            return Self::NetworkTimeout;
        }

        if lower.contains("429") || lower.contains("sign in to confirm you") || lower.contains("blocked") {
            return Self::Blocked;
        }

        if lower.contains("command not found") || lower.contains("no such file or directory") {
            return Self::ToolNotFound(s);
        }

        if lower.contains("json") || lower.contains("parse") {
            return Self::Parse(s);
        }

        if lower.contains("unsupported url") || lower.contains("is not a valid url") {
            return Self::Resolve {
                url: String::new(),
                reason: first_error_line(&s),
            };
        }

        Self::Unknown(s)
    }
}
