// yt-dlp resolver
//
// Metadata comes from `yt-dlp --dump-json`; playlists from
// `--flat-playlist --dump-single-json`. Stream bytes are fetched straight over
// HTTPS when yt-dlp hands us a plain URL (in ranged chunks, the platform throttles
// long unranged reads) and through `yt-dlp -o -` for everything else.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use crate::downloader::errors::DownloadError;
use crate::downloader::models::{MediaItem, Playlist, StreamFormat};
use crate::downloader::traits::{MediaResolver, MediaStream};
use crate::downloader::utils::{get_proxy_args, get_timeout_args, run_output_with_timeout};

/// Size of one ranged request against the media CDN
const CHUNK_SIZE: u64 = 10 * 1024 * 1024;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Settings for talking to the platform
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub ytdlp_path: String,
    /// SOCKS5/HTTP proxy URL
    pub proxy: Option<String>,
    /// Path to cookies.txt file
    pub cookies_path: Option<String>,
    /// Upper bound for one metadata call, in seconds
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            proxy: None,
            cookies_path: None,
            timeout_secs: 60,
        }
    }
}

pub struct YtDlpResolver {
    config: ResolverConfig,
    http: reqwest::Client,
}

impl YtDlpResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, DownloadError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30));

        if let Some(proxy_url) = config.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| DownloadError::Stream(format!("Invalid proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| DownloadError::Stream(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    /// Flags shared by every yt-dlp call
    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["--no-warnings".to_string(), "--no-update".to_string()];
        args.extend(get_timeout_args(self.config.timeout_secs.min(30)));
        args.extend(get_proxy_args(self.config.proxy.as_deref()));
        if let Some(path) = &self.config.cookies_path {
            args.push("--cookies".to_string());
            args.push(path.clone());
        }
        args
    }

    fn item_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-json".to_string(), "--no-playlist".to_string()];
        args.extend(self.common_args());
        args.push(url.to_string());
        args
    }

    fn playlist_args(&self, playlist_url: &str) -> Vec<String> {
        let mut args = vec![
            "--flat-playlist".to_string(),
            "--dump-single-json".to_string(),
        ];
        args.extend(self.common_args());
        args.push(playlist_url.to_string());
        args
    }

    fn stream_args(&self, item: &MediaItem, format: &StreamFormat) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            format.format_id.clone(),
            "-o".to_string(),
            "-".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "--quiet".to_string(),
        ];
        args.extend(self.common_args());
        args.push(item.source_url.clone());
        args
    }

    /// Pull a direct URL in `CHUNK_SIZE` ranges, or in one request if the
    /// size is unknown.
    fn http_stream(&self, url: &str, headers: HeaderMap, size: Option<u64>) -> MediaStream {
        let to_io = |e: reqwest::Error| io::Error::new(io::ErrorKind::Other, e);

        let Some(total) = size else {
            let request = self.http.get(url).headers(headers);
            let body = futures::stream::once(async move {
                request
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map(|r| r.bytes_stream().map_err(to_io))
                    .map_err(to_io)
            })
            .try_flatten();
            return Box::pin(StreamReader::new(body));
        };

        let client = self.http.clone();
        let url = url.to_string();
        let chunks = futures::stream::unfold(0u64, move |start| {
            let client = client.clone();
            let url = url.clone();
            let headers = headers.clone();
            async move {
                if start >= total {
                    return None;
                }
                let end = (start + CHUNK_SIZE).min(total) - 1;
                let response = client
                    .get(&url)
                    .headers(headers)
                    .header(RANGE, format!("bytes={}-{}", start, end))
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                match response {
                    Ok(r) => Some((Ok(r.bytes_stream().map_err(to_io)), end + 1)),
                    // Stop after reporting the failure
                    Err(e) => Some((Err(to_io(e)), total)),
                }
            }
        })
        .try_flatten();

        Box::pin(StreamReader::new(chunks))
    }

    async fn ytdlp_stream(
        &self,
        item: &MediaItem,
        format: &StreamFormat,
    ) -> Result<MediaStream, DownloadError> {
        let args = self.stream_args(item, format);
        tracing::debug!("[YtDlp] piping {} {}", self.config.ytdlp_path, args.join(" "));

        let mut child = TokioCommand::new(&self.config.ytdlp_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::ToolNotFound(format!("yt-dlp: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Stream("Failed to capture yt-dlp stdout".to_string()))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Stream("Failed to capture yt-dlp stderr".to_string()))?;
        let stderr = tokio::spawn(read_stderr(stderr));

        Ok(Box::pin(ProcessStream {
            stdout,
            // Owns the child, so dropping the stream kills yt-dlp
            exit: Box::pin(wait_clean_exit(child, stderr)),
            finished: false,
        }))
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn resolve_item(&self, url: &str) -> Result<MediaItem, DownloadError> {
        let args = self.item_args(url);
        tracing::debug!("[YtDlp] {} {}", self.config.ytdlp_path, args.join(" "));

        let output = run_output_with_timeout(&self.config.ytdlp_path, args, self.config.timeout_secs)
            .await
            .map_err(DownloadError::from)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::resolve(url, &stderr));
        }

        parse_item_json(url, &output.stdout)
    }

    async fn resolve_playlist(&self, playlist_id: &str) -> Result<Playlist, DownloadError> {
        let playlist_url = playlist_url(playlist_id);
        let args = self.playlist_args(&playlist_url);
        tracing::debug!("[YtDlp] {} {}", self.config.ytdlp_path, args.join(" "));

        let output = run_output_with_timeout(&self.config.ytdlp_path, args, self.config.timeout_secs)
            .await
            .map_err(DownloadError::from)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!("[YtDlp] playlist {} failed: {}", playlist_id, stderr.trim());
            return Err(DownloadError::PlaylistUnavailable(playlist_id.to_string()));
        }

        parse_playlist_json(playlist_id, &output.stdout)
    }

    async fn open_stream(
        &self,
        item: &MediaItem,
        format: &StreamFormat,
    ) -> Result<MediaStream, DownloadError> {
        match format.url.as_deref() {
            Some(url) if format.is_direct_http() => {
                tracing::debug!(
                    "[YtDlp] direct HTTP for {} format {} ({:?} bytes)",
                    item.id,
                    format.format_id,
                    format.filesize
                );
                Ok(self.http_stream(url, header_map(&format.http_headers), format.filesize))
            }
            _ => self.ytdlp_stream(item, format).await,
        }
    }
}

/// stdout of a yt-dlp child that is killed when the stream is dropped.
///
/// End of stream is only reported once yt-dlp exited cleanly; a failed exit
/// turns into a read error carrying its last stderr line.
struct ProcessStream {
    stdout: ChildStdout,
    exit: Pin<Box<dyn Future<Output = io::Result<()>> + Send>>,
    finished: bool,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        let exit = ready!(this.exit.as_mut().poll(cx));
        this.finished = true;
        Poll::Ready(exit)
    }
}

async fn wait_clean_exit(mut child: Child, stderr: JoinHandle<String>) -> io::Result<()> {
    let status = child.wait().await?;
    if status.success() {
        return Ok(());
    }
    let stderr = stderr.await.unwrap_or_default();
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("yt-dlp {}: {}", status, stderr_tail(&stderr)),
    ))
}

async fn read_stderr(mut stderr: ChildStderr) -> String {
    let mut text = String::new();
    if let Err(e) = stderr.read_to_string(&mut text).await {
        tracing::debug!("[YtDlp] could not read stderr: {}", e);
    }
    text
}

/// Last non-empty stderr line, usually yt-dlp's `ERROR:` message
fn stderr_tail(stderr: &str) -> &str {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("no error output")
}

/// Bare ids become playlist URLs; full URLs pass through
fn playlist_url(playlist_id: &str) -> String {
    if playlist_id.starts_with("http://") || playlist_id.starts_with("https://") {
        playlist_id.to_string()
    } else {
        format!("https://www.youtube.com/playlist?list={}", playlist_id)
    }
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    headers
        .iter()
        .filter_map(|(k, v)| {
            let name = HeaderName::from_bytes(k.as_bytes()).ok()?;
            let value = HeaderValue::from_str(v).ok()?;
            Some((name, value))
        })
        .collect()
}

/// "1080p60"-style label, like the platform shows in its quality menu
fn quality_label(f: &serde_json::Value) -> Option<String> {
    lazy_static::lazy_static! {
        static ref LABEL_RE: Regex = Regex::new(r"^(\d{3,4}p)(\d{2})?").unwrap();
    }

    if let Some(note) = f["format_note"].as_str() {
        if let Some(caps) = LABEL_RE.captures(note) {
            return Some(caps.get(0)?.as_str().to_string());
        }
    }

    let height = f["height"].as_u64()?;
    let fps = f["fps"].as_f64().unwrap_or(0.0).round() as u64;
    if fps > 30 {
        Some(format!("{}p{}", height, fps))
    } else {
        Some(format!("{}p", height))
    }
}

fn parse_formats(json: &serde_json::Value) -> Vec<StreamFormat> {
    let Some(formats) = json["formats"].as_array() else {
        return Vec::new();
    };

    formats
        .iter()
        .map(|f| {
            let vcodec = f["vcodec"].as_str().map(|s| s.to_string());
            let has_video = vcodec.as_deref().map_or(false, |v| v != "none");
            let http_headers = f["http_headers"]
                .as_object()
                .map(|h| {
                    h.iter()
                        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            StreamFormat {
                format_id: f["format_id"].as_str().unwrap_or("").to_string(),
                ext: f["ext"].as_str().unwrap_or("").to_string(),
                quality_label: if has_video { quality_label(f) } else { None },
                height: f["height"].as_u64().map(|h| h as u32),
                fps: f["fps"].as_f64().map(|v| v as f32),
                vcodec,
                acodec: f["acodec"].as_str().map(|s| s.to_string()),
                abr: f["abr"].as_f64().map(|v| v as f32),
                tbr: f["tbr"].as_f64().map(|v| v as f32),
                filesize: f["filesize"].as_u64(),
                url: f["url"].as_str().map(|s| s.to_string()),
                protocol: f["protocol"].as_str().map(|s| s.to_string()),
                http_headers,
            }
        })
        .collect()
}

fn parse_item_json(url: &str, stdout: &[u8]) -> Result<MediaItem, DownloadError> {
    let json: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| DownloadError::Parse(format!("Invalid JSON from yt-dlp: {}", e)))?;

    let id = json["id"]
        .as_str()
        .ok_or_else(|| DownloadError::Parse("yt-dlp output has no id".to_string()))?
        .to_string();

    Ok(MediaItem {
        source_url: json["webpage_url"].as_str().unwrap_or(url).to_string(),
        title: json["title"].as_str().unwrap_or(&id).to_string(),
        uploader: json["uploader"].as_str().unwrap_or("Unknown").to_string(),
        duration_seconds: json["duration"].as_f64().unwrap_or(0.0).round() as u64,
        formats: parse_formats(&json),
        id,
    })
}

fn parse_playlist_json(playlist_id: &str, stdout: &[u8]) -> Result<Playlist, DownloadError> {
    let json: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| DownloadError::Parse(format!("Invalid JSON from yt-dlp: {}", e)))?;

    let entries = json["entries"]
        .as_array()
        .ok_or_else(|| DownloadError::PlaylistUnavailable(playlist_id.to_string()))?
        .iter()
        .filter_map(|entry| {
            entry["url"]
                .as_str()
                .or_else(|| entry["webpage_url"].as_str())
                .map(|s| s.to_string())
                .or_else(|| {
                    entry["id"]
                        .as_str()
                        .map(|id| format!("https://www.youtube.com/watch?v={}", id))
                })
        })
        .collect();

    Ok(Playlist {
        id: json["id"].as_str().unwrap_or(playlist_id).to_string(),
        title: json["title"].as_str().unwrap_or(playlist_id).to_string(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM_JSON: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Song: \"Best\" / Mix?",
        "uploader": "Someone",
        "duration": 212.0,
        "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        "formats": [
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
             "abr": 129.5, "filesize": 3433514, "protocol": "https",
             "url": "https://rr1.example.test/videoplayback?itag=140",
             "http_headers": {"User-Agent": "UA", "Accept": "*/*"}},
            {"format_id": "299", "ext": "mp4", "vcodec": "avc1.64002a", "acodec": "none",
             "height": 1080, "fps": 60, "format_note": "1080p60", "protocol": "https",
             "url": "https://rr1.example.test/videoplayback?itag=299"},
            {"format_id": "136", "ext": "mp4", "vcodec": "avc1.4d401f", "acodec": "none",
             "height": 720, "fps": 25, "protocol": "https"},
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none",
             "format_note": "storyboard", "protocol": "mhtml"}
        ]
    }"#;

    #[test]
    fn parses_item_metadata_and_formats() {
        let item = parse_item_json("https://youtu.be/dQw4w9WgXcQ", ITEM_JSON.as_bytes()).unwrap();

        assert_eq!(item.id, "dQw4w9WgXcQ");
        assert_eq!(item.title, "Song: \"Best\" / Mix?");
        assert_eq!(item.duration_seconds, 212);
        assert_eq!(item.formats.len(), 4);

        let audio = &item.formats[0];
        assert!(audio.is_audio_only());
        assert!(audio.quality_label.is_none());
        assert_eq!(audio.http_headers.get("Accept").map(String::as_str), Some("*/*"));
        assert!(audio.is_direct_http());

        assert_eq!(item.formats[1].quality_label.as_deref(), Some("1080p60"));
        // No format_note: derived from height, 25fps stays unlabelled
        assert_eq!(item.formats[2].quality_label.as_deref(), Some("720p"));
        assert!(!item.formats[2].is_direct_http());
    }

    #[test]
    fn rejects_garbage_output() {
        assert!(matches!(
            parse_item_json("u", b"not json"),
            Err(DownloadError::Parse(_))
        ));
    }

    #[test]
    fn parses_flat_playlist() {
        let json = r#"{
            "id": "PL123", "title": "My Playlist",
            "entries": [
                {"id": "a1", "url": "https://www.youtube.com/watch?v=a1"},
                {"id": "b2"},
                {"id": "c3", "url": "https://www.youtube.com/watch?v=c3"}
            ]
        }"#;
        let playlist = parse_playlist_json("PL123", json.as_bytes()).unwrap();

        assert_eq!(playlist.title, "My Playlist");
        assert_eq!(
            playlist.entries,
            vec![
                "https://www.youtube.com/watch?v=a1",
                "https://www.youtube.com/watch?v=b2",
                "https://www.youtube.com/watch?v=c3",
            ]
        );
    }

    #[test]
    fn playlist_ids_become_urls() {
        assert_eq!(playlist_url("PL123"), "https://www.youtube.com/playlist?list=PL123");
        assert_eq!(
            playlist_url("https://example.test/list"),
            "https://example.test/list"
        );
    }

    #[test]
    fn item_args_include_proxy_and_cookies() {
        let resolver = YtDlpResolver::new(ResolverConfig {
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            cookies_path: Some("/tmp/cookies.txt".to_string()),
            ..Default::default()
        })
        .unwrap();

        let args = resolver.item_args("https://youtu.be/x");
        assert_eq!(args[0], "--dump-json");
        assert!(args.windows(2).any(|w| w == ["--proxy", "socks5://127.0.0.1:1080"]));
        assert!(args.windows(2).any(|w| w == ["--cookies", "/tmp/cookies.txt"]));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/x"));
    }

    #[test]
    fn stderr_tail_takes_the_last_line() {
        assert_eq!(
            stderr_tail("WARNING: slow\nERROR: HTTP Error 403: Forbidden\n\n"),
            "ERROR: HTTP Error 403: Forbidden"
        );
        assert_eq!(stderr_tail(""), "no error output");
    }

    /// Resolver whose yt-dlp is a shell script
    #[cfg(unix)]
    fn scripted_resolver(dir: &std::path::Path, script: &str) -> YtDlpResolver {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        YtDlpResolver::new(ResolverConfig {
            ytdlp_path: path.to_string_lossy().into_owned(),
            ..Default::default()
        })
        .unwrap()
    }

    #[cfg(unix)]
    fn piped_item() -> (MediaItem, StreamFormat) {
        let item = parse_item_json("https://youtu.be/dQw4w9WgXcQ", ITEM_JSON.as_bytes()).unwrap();
        // 136 has no direct URL, so it goes through yt-dlp
        let format = item.formats[2].clone();
        (item, format)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_stream_reads_until_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = scripted_resolver(dir.path(), "printf 'media bytes'");
        let (item, format) = piped_item();

        let mut stream = resolver.open_stream(&item, &format).await.unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();

        assert_eq!(data, b"media bytes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_stream_fails_when_ytdlp_fails() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = scripted_resolver(
            dir.path(),
            "printf partial; echo 'ERROR: HTTP Error 403: Forbidden' >&2; exit 1",
        );
        let (item, format) = piped_item();

        let mut stream = resolver.open_stream(&item, &format).await.unwrap();
        let mut data = Vec::new();
        let err = stream.read_to_end(&mut data).await.unwrap_err();

        assert_eq!(data, b"partial");
        assert!(err.to_string().contains("HTTP Error 403"), "{}", err);
    }
}
