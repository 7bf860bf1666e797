// Downloader module: resolve, select, transfer, report

pub mod backends;
pub mod errors;
pub mod format_selector;
pub mod item;
pub mod models;
pub mod orchestrator;
pub mod paths;
pub mod playlist;
pub mod sanitize;
pub mod tools;
pub mod traits;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::DownloadError;
pub use item::{FadeTiming, ItemDownloader};
pub use models::{DownloadOutcome, DownloadRequest, MediaItem, OutputFormat, PlaylistSummary};
pub use orchestrator::Downloader;
pub use playlist::{extract_playlist_id, PlaylistDownloader};
pub use sanitize::sanitize;
pub use traits::{MediaResolver, Transcoder};
