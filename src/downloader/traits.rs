// Seams between the download pipeline and the outside world

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::models::{MediaItem, Playlist, StreamFormat};

/// Raw media bytes of one stream
pub type MediaStream = Pin<Box<dyn AsyncRead + Send>>;

/// Receives the encoder's elapsed media time as it advances
pub type ProgressSink = UnboundedSender<Duration>;

/// Turns URLs into metadata and byte streams
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Name of the resolver (for logging)
    fn name(&self) -> &'static str;

    /// Item metadata plus every stream the platform offers
    async fn resolve_item(&self, url: &str) -> Result<MediaItem, DownloadError>;

    /// Ordered entry URLs and title of a playlist
    async fn resolve_playlist(&self, playlist_id: &str) -> Result<Playlist, DownloadError>;

    /// Open the bytes of one of the item's streams
    async fn open_stream(
        &self,
        item: &MediaItem,
        format: &StreamFormat,
    ) -> Result<MediaStream, DownloadError>;
}

/// External encoder: audio-only encode and dual-input mux
#[async_trait]
pub trait Transcoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encode `audio` to an MP3 at `output`
    async fn encode_audio(
        &self,
        audio: MediaStream,
        output: &Path,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>;

    /// Take audio from `audio` and video from `video` (copied, not re-encoded)
    /// into one MP4 at `output`. Both streams are drained concurrently.
    async fn mux(
        &self,
        audio: MediaStream,
        video: MediaStream,
        output: &Path,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>;
}
