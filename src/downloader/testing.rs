// In-memory resolver and transcoder for pipeline tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::models::{MediaItem, Playlist, StreamFormat};
use super::traits::{MediaResolver, MediaStream, ProgressSink, Transcoder};

/// Item with one AAC audio stream and a 720p H.264 video-only stream
pub fn media_item(id: &str, title: &str, duration_seconds: u64) -> MediaItem {
    MediaItem {
        source_url: format!("https://www.youtube.com/watch?v={}", id),
        id: id.to_string(),
        title: title.to_string(),
        uploader: "Someone".to_string(),
        duration_seconds,
        formats: vec![
            StreamFormat {
                format_id: "140".to_string(),
                ext: "m4a".to_string(),
                vcodec: Some("none".to_string()),
                acodec: Some("mp4a.40.2".to_string()),
                abr: Some(129.5),
                ..Default::default()
            },
            StreamFormat {
                format_id: "136".to_string(),
                ext: "mp4".to_string(),
                quality_label: Some("720p".to_string()),
                height: Some(720),
                vcodec: Some("avc1.4d401f".to_string()),
                acodec: Some("none".to_string()),
                ..Default::default()
            },
        ],
    }
}

#[derive(Default)]
pub struct FakeResolver {
    items: HashMap<String, MediaItem>,
    playlists: HashMap<String, Playlist>,
}

impl FakeResolver {
    pub fn with_item(mut self, url: &str, item: MediaItem) -> Self {
        self.items.insert(url.to_string(), item);
        self
    }

    pub fn with_playlist(mut self, playlist: Playlist) -> Self {
        self.playlists.insert(playlist.id.clone(), playlist);
        self
    }
}

#[async_trait]
impl MediaResolver for FakeResolver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn resolve_item(&self, url: &str) -> Result<MediaItem, DownloadError> {
        self.items.get(url).cloned().ok_or_else(|| DownloadError::Resolve {
            url: url.to_string(),
            reason: "Video unavailable".to_string(),
        })
    }

    async fn resolve_playlist(&self, playlist_id: &str) -> Result<Playlist, DownloadError> {
        self.playlists
            .get(playlist_id)
            .cloned()
            .ok_or_else(|| DownloadError::PlaylistUnavailable(playlist_id.to_string()))
    }

    async fn open_stream(
        &self,
        _item: &MediaItem,
        format: &StreamFormat,
    ) -> Result<MediaStream, DownloadError> {
        // Stream bytes are the format id, so outputs show what was picked
        Ok(Box::pin(std::io::Cursor::new(format.format_id.clone().into_bytes())))
    }
}

/// Writes the input bytes to the output and reports `marks` as progress
#[derive(Default)]
pub struct FakeTranscoder {
    pub marks: Vec<Duration>,
    /// Leave a partial file behind and fail
    pub fail: bool,
    /// Same as `fail`, for this output file name only
    pub fail_output: Option<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTranscoder {
    async fn write(&self, bytes: Vec<u8>, output: &Path, progress: ProgressSink) -> Result<(), DownloadError> {
        for mark in &self.marks {
            let _ = progress.send(*mark);
        }
        tokio::fs::write(output, &bytes).await?;
        let name = output.file_name().and_then(|n| n.to_str());
        if self.fail || (name.is_some() && name == self.fail_output.as_deref()) {
            return Err(DownloadError::Transcode("pipe:5: Invalid data".to_string()));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }
}

async fn drain(mut stream: MediaStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    buf
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn encode_audio(
        &self,
        audio: MediaStream,
        output: &Path,
        progress: ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let bytes = drain(audio).await;
        self.record(format!("encode {}", String::from_utf8_lossy(&bytes)));
        self.write(bytes, output, progress).await
    }

    async fn mux(
        &self,
        audio: MediaStream,
        video: MediaStream,
        output: &Path,
        progress: ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let (mut bytes, video) = tokio::join!(drain(audio), drain(video));
        self.record(format!(
            "mux {}+{}",
            String::from_utf8_lossy(&bytes),
            String::from_utf8_lossy(&video)
        ));
        bytes.extend(video);
        self.write(bytes, output, progress).await
    }
}
