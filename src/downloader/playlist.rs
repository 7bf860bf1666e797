// Playlist download: one folder, one task per entry, join all

use std::path::Path;

use regex::Regex;
use tokio::task::JoinSet;

use super::errors::DownloadError;
use super::item::ItemDownloader;
use super::models::{OutputFormat, PlaylistSummary};
use super::paths::create_unique_dir;
use super::sanitize::sanitize;

lazy_static::lazy_static! {
    static ref LIST_RE: Regex = Regex::new(r"list=([^&]+)").unwrap();
}

/// Whether the URL names a playlist
pub fn is_playlist_url(url: &str) -> bool {
    url.contains("list=")
}

/// Value of `list=` up to the next `&`. Without one the whole URL is returned
/// and resolution is left to fail on it.
pub fn extract_playlist_id(url: &str) -> String {
    LIST_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| url.to_string())
}

#[derive(Clone)]
pub struct PlaylistDownloader {
    items: ItemDownloader,
}

impl PlaylistDownloader {
    pub fn new(items: ItemDownloader) -> Self {
        Self { items }
    }

    /// Download every entry of the playlist at `url` into a fresh folder under
    /// `base_dir`. Individual failures are collected, not propagated.
    pub async fn download_playlist(
        &self,
        url: &str,
        format: &OutputFormat,
        base_dir: &Path,
    ) -> Result<PlaylistSummary, DownloadError> {
        let playlist_id = extract_playlist_id(url);
        let playlist = self
            .items
            .resolver()
            .resolve_playlist(&playlist_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[Playlist] This playlist either does not exist or is private ({}): {}",
                    playlist_id,
                    e
                );
                e
            })?;

        let title = match sanitize(playlist.title.trim()) {
            t if t.trim_matches('.').is_empty() => playlist.id.clone(),
            t => t,
        };
        let directory = create_unique_dir(&base_dir.join(&title))?;
        tracing::info!(
            "[Playlist] {} entries of \"{}\" -> {}",
            playlist.entries.len(),
            playlist.title,
            directory.display()
        );

        let mut tasks = JoinSet::new();
        for (index, entry) in playlist.entries.iter().cloned().enumerate() {
            let items = self.items.clone();
            let format = format.clone();
            let directory = directory.clone();
            tasks.spawn(async move {
                let result = items.download_item(&entry, &format, &directory).await;
                (index, result)
            });
        }

        let mut results = Vec::with_capacity(playlist.entries.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => results.push(done),
                Err(e) => tracing::error!("[Playlist] item task failed: {}", e),
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let mut summary = PlaylistSummary {
            title: playlist.title.clone(),
            directory,
            ..Default::default()
        };
        let mut results = results.into_iter().peekable();
        for (index, entry) in playlist.entries.iter().enumerate() {
            match results.next_if(|(i, _)| *i == index) {
                Some((_, Ok(path))) => summary.succeeded.push(path),
                Some((_, Err(e))) => summary.failed.push((entry.clone(), e.to_string())),
                None => summary
                    .failed
                    .push((entry.clone(), "download task panicked".to_string())),
            }
        }

        tracing::info!(
            "[Playlist] done: {}/{} succeeded",
            summary.succeeded.len(),
            summary.total()
        );
        Ok(summary)
    }
}
