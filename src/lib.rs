// tubefetch: paste a URL, pick MP3 or a video quality, get files on disk.

pub mod cli;
pub mod config;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod downloader;
pub mod logging;
pub mod progress;

pub use config::AppConfig;
pub use downloader::{DownloadError, DownloadOutcome, DownloadRequest, Downloader, OutputFormat};
pub use progress::{ProgressEvent, ProgressRegistry};
