// Downloader backends

pub mod ffmpeg;
pub mod ytdlp;

pub use ffmpeg::FfmpegTranscoder;
pub use ytdlp::{ResolverConfig, YtDlpResolver};
