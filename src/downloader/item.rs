// Single item download
//
// resolve -> pick a free name -> register the indicator -> encode or mux ->
// fade the indicator out. Failures never leave a half-written file behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::format_selector::FormatSelector;
use super::models::{MediaItem, OutputFormat};
use super::paths::{output_path, resolve_unique};
use super::sanitize::sanitize;
use super::traits::{MediaResolver, MediaStream, Transcoder};
use super::utils::progress_percent;
use crate::progress::ProgressRegistry;

/// How long a finished indicator stays up, then how long it fades
#[derive(Debug, Clone, Copy)]
pub struct FadeTiming {
    pub delay: Duration,
    pub fade: Duration,
}

impl Default for FadeTiming {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1500),
            fade: Duration::from_secs(2),
        }
    }
}

/// Output paths handed out to downloads that have not finished yet.
///
/// Concurrent items with the same title would otherwise all see a free name on
/// disk, since nothing is written until the transcoder starts.
#[derive(Clone, Default)]
struct Reservations(Arc<Mutex<HashSet<PathBuf>>>);

impl Reservations {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Free output path for `name` in `destination`, held until the guard drops
    fn claim(&self, destination: &Path, name: &str, ext: &str) -> Reservation {
        let mut taken = self.lock();
        let stem = resolve_unique(&destination.join(name), |p| taken.contains(p) || p.exists());
        let path = output_path(&stem, ext);
        taken.insert(path.clone());
        Reservation {
            owner: self.clone(),
            path,
        }
    }
}

struct Reservation {
    owner: Reservations,
    path: PathBuf,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.path);
    }
}

/// Opened input streams, ready for the transcoder
enum Inputs {
    Audio(MediaStream),
    AudioVideo(MediaStream, MediaStream),
}

#[derive(Clone)]
pub struct ItemDownloader {
    resolver: Arc<dyn MediaResolver>,
    transcoder: Arc<dyn Transcoder>,
    progress: ProgressRegistry,
    timing: FadeTiming,
    cancel: CancellationToken,
    reservations: Reservations,
}

impl ItemDownloader {
    pub fn new(
        resolver: Arc<dyn MediaResolver>,
        transcoder: Arc<dyn Transcoder>,
        progress: ProgressRegistry,
        timing: FadeTiming,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            transcoder,
            progress,
            timing,
            cancel,
            reservations: Reservations::default(),
        }
    }

    pub fn resolver(&self) -> &Arc<dyn MediaResolver> {
        &self.resolver
    }

    /// Download `url` into `destination` and return the written file.
    pub async fn download_item(
        &self,
        url: &str,
        format: &OutputFormat,
        destination: &Path,
    ) -> Result<PathBuf, DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        tokio::fs::create_dir_all(destination).await?;

        let item = self.resolver.resolve_item(url).await.map_err(|e| {
            tracing::warn!("[Item] skipping {}: {}", url, e);
            e
        })?;

        let reservation = self
            .reservations
            .claim(destination, &file_stem(&item), format.extension());
        let output = reservation.path.clone();
        tracing::info!(
            "[Item] {} ({}) -> {} via {}/{}",
            item.id,
            format,
            output.display(),
            self.resolver.name(),
            self.transcoder.name()
        );

        let key = self.progress.spawn(&item.id, &item.title);
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = self.forward_progress(rx, key.clone(), item.duration_seconds);

        // Only a transcoder that ran can have written `output`
        let result = match self.open_inputs(&item, format).await {
            Ok(inputs) => {
                let written = self.transcode(inputs, &output, tx).await;
                if written.is_err() {
                    remove_partial(&output).await;
                }
                written
            }
            Err(e) => {
                drop(tx);
                Err(e)
            }
        };
        let _ = forwarder.await;

        match &result {
            Ok(()) => {
                self.progress.update(&key, 100);
                tracing::info!("[Item] ✓ {}", output.display());
            }
            Err(e) => {
                tracing::error!("[Item] ✗ {}: {}", item.id, e);
                self.progress.fail(&key, &e.to_string());
            }
        }
        self.progress
            .fade_and_remove(&key, self.timing.delay, self.timing.fade);

        result.map(|_| output)
    }

    async fn open_inputs(&self, item: &MediaItem, format: &OutputFormat) -> Result<Inputs, DownloadError> {
        let audio = FormatSelector::select_audio(&item.formats).ok_or_else(|| {
            DownloadError::NoMatchingStream {
                quality: "audio".to_string(),
                title: item.title.clone(),
            }
        })?;

        match format {
            OutputFormat::Audio => {
                tracing::debug!("[Item] {} audio stream {}", item.id, audio.format_id);
                let stream = self.resolver.open_stream(item, audio).await?;
                Ok(Inputs::Audio(stream))
            }
            OutputFormat::Video(quality) => {
                let video = FormatSelector::select_video(&item.formats, quality).ok_or_else(|| {
                    DownloadError::NoMatchingStream {
                        quality: quality.clone(),
                        title: item.title.clone(),
                    }
                })?;
                tracing::debug!(
                    "[Item] {} audio stream {}, video stream {}",
                    item.id,
                    audio.format_id,
                    video.format_id
                );
                let (audio, video) = tokio::try_join!(
                    self.resolver.open_stream(item, audio),
                    self.resolver.open_stream(item, video)
                )?;
                Ok(Inputs::AudioVideo(audio, video))
            }
        }
    }

    async fn transcode(
        &self,
        inputs: Inputs,
        output: &Path,
        progress: mpsc::UnboundedSender<Duration>,
    ) -> Result<(), DownloadError> {
        match inputs {
            Inputs::Audio(audio) => {
                self.transcoder
                    .encode_audio(audio, output, progress, &self.cancel)
                    .await
            }
            Inputs::AudioVideo(audio, video) => {
                self.transcoder
                    .mux(audio, video, output, progress, &self.cancel)
                    .await
            }
        }
    }

    /// Turn elapsed media time into percent updates until the sender goes away
    fn forward_progress(
        &self,
        mut rx: mpsc::UnboundedReceiver<Duration>,
        key: String,
        total_seconds: u64,
    ) -> JoinHandle<()> {
        let progress = self.progress.clone();
        tokio::spawn(async move {
            while let Some(elapsed) = rx.recv().await {
                progress.update(&key, progress_percent(elapsed, total_seconds));
            }
        })
    }
}

/// Sanitized title, or the item id when nothing usable is left
fn file_stem(item: &MediaItem) -> String {
    let name = sanitize(item.title.trim());
    if name.is_empty() {
        item.id.clone()
    } else {
        name
    }
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => tracing::debug!("[Item] removed partial {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("[Item] could not remove {}: {}", output.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{media_item, FakeResolver, FakeTranscoder};
    use crate::progress::ProgressEvent;

    const URL: &str = "https://www.youtube.com/watch?v=abc";

    fn downloader(resolver: FakeResolver, transcoder: Arc<FakeTranscoder>) -> (ItemDownloader, ProgressRegistry) {
        let progress = ProgressRegistry::default();
        let items = ItemDownloader::new(
            Arc::new(resolver),
            transcoder,
            progress.clone(),
            FadeTiming {
                delay: Duration::ZERO,
                fade: Duration::ZERO,
            },
            CancellationToken::new(),
        );
        (items, progress)
    }

    #[tokio::test]
    async fn audio_progress_is_a_percentage_of_duration() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(FakeTranscoder {
            marks: vec![Duration::from_secs(25)],
            ..Default::default()
        });
        let (items, progress) = downloader(
            FakeResolver::default().with_item(URL, media_item("abc", "Song: \"Best\" / Mix?", 100)),
            transcoder.clone(),
        );
        let mut rx = progress.subscribe();

        let path = items
            .download_item(URL, &OutputFormat::Audio, dir.path())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("Songː ''Best'' ∕ Mix？.mp3"));
        assert_eq!(std::fs::read(&path).unwrap(), b"140");

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Updated { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, vec![25, 100]);
    }

    #[tokio::test]
    async fn video_muxes_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(FakeTranscoder {
            marks: vec![Duration::from_secs(15), Duration::from_secs(45)],
            ..Default::default()
        });
        let (items, progress) = downloader(
            FakeResolver::default().with_item(URL, media_item("abc", "Clip", 60)),
            transcoder.clone(),
        );
        let mut rx = progress.subscribe();

        let path = items
            .download_item(URL, &OutputFormat::Video("720p".to_string()), dir.path())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("Clip.mp4"));
        assert_eq!(transcoder.calls.lock().unwrap().as_slice(), ["mux 140+136"]);

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Updated { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, vec![25, 75, 100]);
    }

    #[tokio::test]
    async fn concurrent_items_with_one_title_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let other = "https://www.youtube.com/watch?v=def";
        let (items, _) = downloader(
            FakeResolver::default()
                .with_item(URL, media_item("abc", "Intro", 10))
                .with_item(other, media_item("def", "Intro", 10)),
            Arc::new(FakeTranscoder::default()),
        );

        let (first, second) = tokio::join!(
            items.download_item(URL, &OutputFormat::Audio, dir.path()),
            items.download_item(other, &OutputFormat::Audio, dir.path())
        );

        let mut paths = vec![first.unwrap(), second.unwrap()];
        paths.sort();
        assert_eq!(
            paths,
            vec![dir.path().join("Intro (1).mp3"), dir.path().join("Intro.mp3")]
        );
    }

    /// Resolves like `FakeResolver`, but another writer takes `path` while the
    /// stream is being opened, and the open fails
    struct TakenWhileOpening {
        inner: FakeResolver,
        path: PathBuf,
    }

    #[async_trait::async_trait]
    impl MediaResolver for TakenWhileOpening {
        fn name(&self) -> &'static str {
            "taken"
        }

        async fn resolve_item(&self, url: &str) -> Result<MediaItem, DownloadError> {
            self.inner.resolve_item(url).await
        }

        async fn resolve_playlist(&self, id: &str) -> Result<crate::downloader::models::Playlist, DownloadError> {
            self.inner.resolve_playlist(id).await
        }

        async fn open_stream(
            &self,
            _item: &MediaItem,
            _format: &crate::downloader::models::StreamFormat,
        ) -> Result<MediaStream, DownloadError> {
            tokio::fs::write(&self.path, b"theirs").await?;
            Err(DownloadError::Stream("HTTP Error 403: Forbidden".to_string()))
        }
    }

    #[tokio::test]
    async fn failure_before_transcoding_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("Clip.mp3");
        let transcoder = Arc::new(FakeTranscoder::default());
        let (items, _) = downloader(FakeResolver::default(), transcoder.clone());
        let items = ItemDownloader {
            resolver: Arc::new(TakenWhileOpening {
                inner: FakeResolver::default().with_item(URL, media_item("abc", "Clip", 60)),
                path: output.clone(),
            }),
            ..items
        };

        let err = items
            .download_item(URL, &OutputFormat::Audio, dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Stream(_)));
        assert!(transcoder.calls.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(&output).unwrap(), b"theirs");
    }

    #[tokio::test]
    async fn existing_output_gets_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Clip.mp4"), b"old").unwrap();
        let (items, _) = downloader(
            FakeResolver::default().with_item(URL, media_item("abc", "Clip", 60)),
            Arc::new(FakeTranscoder::default()),
        );

        let path = items
            .download_item(URL, &OutputFormat::Audio, dir.path())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("Clip (1).mp3"));
        assert_eq!(std::fs::read(dir.path().join("Clip.mp4")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn unavailable_quality_is_an_explicit_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(FakeTranscoder::default());
        let (items, progress) = downloader(
            FakeResolver::default().with_item(URL, media_item("abc", "Clip", 60)),
            transcoder.clone(),
        );

        let err = items
            .download_item(URL, &OutputFormat::Video("1080p".to_string()), dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::NoMatchingStream { ref quality, .. } if quality == "1080p"));
        assert!(transcoder.calls.lock().unwrap().is_empty());
        assert!(progress.snapshot()[0].error.is_some());
    }

    #[tokio::test]
    async fn failed_transcode_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let (items, _) = downloader(
            FakeResolver::default().with_item(URL, media_item("abc", "Clip", 60)),
            Arc::new(FakeTranscoder {
                fail: true,
                ..Default::default()
            }),
        );

        let err = items
            .download_item(URL, &OutputFormat::Audio, dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Transcode(_)));
        assert!(!dir.path().join("Clip.mp3").exists());
    }

    #[tokio::test]
    async fn unresolvable_url_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (items, progress) = downloader(FakeResolver::default(), Arc::new(FakeTranscoder::default()));

        let err = items
            .download_item(URL, &OutputFormat::Audio, dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Resolve { .. }));
        assert!(progress.snapshot().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_titles_fall_back_to_the_id() {
        assert_eq!(file_stem(&media_item("abc", "  ", 1)), "abc");
        assert_eq!(file_stem(&media_item("abc", "a/b", 1)), "a∕b");
    }
}
