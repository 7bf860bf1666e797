// Orchestrator: the single "download" action behind every surface

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::backends::{FfmpegTranscoder, ResolverConfig, YtDlpResolver};
use super::errors::DownloadError;
use super::format_selector::{FormatSelector, QualityOption};
use super::item::{FadeTiming, ItemDownloader};
use super::models::{DownloadOutcome, DownloadRequest};
use super::playlist::{is_playlist_url, PlaylistDownloader};
use super::tools::{ToolManager, ToolType};
use super::traits::{MediaResolver, Transcoder};
use crate::config::AppConfig;
use crate::progress::ProgressRegistry;

pub struct Downloader {
    items: ItemDownloader,
    playlists: PlaylistDownloader,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        resolver: Arc<dyn MediaResolver>,
        transcoder: Arc<dyn Transcoder>,
        progress: ProgressRegistry,
        timing: FadeTiming,
        cancel: CancellationToken,
    ) -> Self {
        let items = ItemDownloader::new(resolver, transcoder, progress, timing, cancel.clone());
        Self {
            playlists: PlaylistDownloader::new(items.clone()),
            items,
            cancel,
        }
    }

    /// yt-dlp + ffmpeg as found by the tool manager, tuned by `config`
    pub fn from_config(config: &AppConfig, progress: ProgressRegistry) -> Result<Self, DownloadError> {
        let tools = ToolManager::from_config(config);
        let ytdlp_path = tools.resolve_binary(ToolType::YtDlp)?;
        let ffmpeg_path = tools.resolve_binary(ToolType::Ffmpeg)?;
        tracing::info!("[Downloader] yt-dlp at {}, ffmpeg at {}", ytdlp_path, ffmpeg_path);

        let resolver = YtDlpResolver::new(ResolverConfig {
            ytdlp_path,
            proxy: config.proxy.clone(),
            cookies_path: config.cookies_path.clone(),
            timeout_secs: config.resolve_timeout_secs,
        })?;
        let transcoder = FfmpegTranscoder::new(
            ffmpeg_path,
            config.audio_bitrate_kbps,
            config.transcode_timeout(),
        );

        Ok(Self::new(
            Arc::new(resolver),
            Arc::new(transcoder),
            progress,
            config.fade_timing(),
            CancellationToken::new(),
        ))
    }

    /// Playlist URLs (anything with `list=`) go to the playlist downloader,
    /// everything else is a single item.
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadOutcome, DownloadError> {
        let url = request.url.trim();
        if is_playlist_url(url) {
            tracing::info!("[Downloader] playlist {} as {}", url, request.format);
            let summary = self
                .playlists
                .download_playlist(url, &request.format, &request.destination)
                .await?;
            Ok(DownloadOutcome::Playlist(summary))
        } else {
            tracing::info!("[Downloader] item {} as {}", url, request.format);
            let path = self
                .items
                .download_item(url, &request.format, &request.destination)
                .await?;
            Ok(DownloadOutcome::Item { path })
        }
    }

    /// Menu entries the item at `url` can actually serve
    pub async fn quality_options(&self, url: &str) -> Result<Vec<QualityOption>, DownloadError> {
        let item = self.items.resolver().resolve_item(url.trim()).await?;
        Ok(FormatSelector::build_quality_options(&item))
    }

    /// Stop every running download; their partial files are removed
    pub fn cancel(&self) {
        tracing::info!("[Downloader] cancelling");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::downloader::models::{OutputFormat, Playlist};
    use crate::downloader::testing::{media_item, FakeResolver, FakeTranscoder};

    fn downloader(resolver: FakeResolver) -> Downloader {
        Downloader::new(
            Arc::new(resolver),
            Arc::new(FakeTranscoder::default()),
            ProgressRegistry::default(),
            FadeTiming {
                delay: Duration::ZERO,
                fade: Duration::ZERO,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn single_urls_download_one_item() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://www.youtube.com/watch?v=abc";
        let d = downloader(FakeResolver::default().with_item(url, media_item("abc", "Song", 10)));

        let outcome = d
            .download(DownloadRequest::new(format!("  {}  ", url), OutputFormat::Audio, dir.path()))
            .await
            .unwrap();

        match outcome {
            DownloadOutcome::Item { path } => assert_eq!(path, dir.path().join("Song.mp3")),
            other => panic!("expected an item, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_urls_download_a_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let entry = "https://www.youtube.com/watch?v=abc";
        let d = downloader(
            FakeResolver::default()
                .with_playlist(Playlist {
                    id: "PL9".to_string(),
                    title: "Mix: 2024".to_string(),
                    entries: vec![entry.to_string()],
                })
                .with_item(entry, media_item("abc", "Song", 10)),
        );

        let outcome = d
            .download(DownloadRequest::new(
                "https://www.youtube.com/watch?v=abc&list=PL9",
                OutputFormat::Video("720p".to_string()),
                dir.path(),
            ))
            .await
            .unwrap();

        match outcome {
            DownloadOutcome::Playlist(summary) => {
                assert_eq!(summary.directory, dir.path().join("Mixː 2024"));
                assert_eq!(summary.succeeded, vec![dir.path().join("Mixː 2024").join("Song.mp4")]);
            }
            other => panic!("expected a playlist, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn quality_options_come_from_the_item() {
        let url = "https://www.youtube.com/watch?v=abc";
        let d = downloader(FakeResolver::default().with_item(url, media_item("abc", "Song", 10)));

        let values: Vec<String> = d
            .quality_options(url)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.value)
            .collect();

        assert_eq!(values, vec!["720p", "mp3"]);
    }

    #[tokio::test]
    async fn cancelled_downloads_do_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://www.youtube.com/watch?v=abc";
        let d = downloader(FakeResolver::default().with_item(url, media_item("abc", "Song", 10)));
        d.cancel();

        let err = d
            .download(DownloadRequest::new(url, OutputFormat::Audio, dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert!(!dir.path().join("Song.mp3").exists());
    }
}
