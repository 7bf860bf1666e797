// FormatSelector - picks the streams behind each menu entry
//
// Handles:
// - Audio stream for both MP3 and MP4 output (highest bitrate)
// - Video-only MP4 stream for a quality label, 60fps variant first
// - Listing which menu entries an item can actually serve

use serde::{Deserialize, Serialize};

use super::models::{MediaItem, StreamFormat, QUALITY_LABELS};

/// Quality option for UI display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOption {
    /// Display label (e.g., "1080p60 (H.264, 150 MB)")
    pub label: String,

    /// Value for selection (e.g., "1080p", "mp3")
    pub value: String,

    /// Estimated file size (e.g., "150 MB")
    pub estimated_size: Option<String>,

    /// Codec info (e.g., "H.264" or "VP9")
    pub codec_info: Option<String>,

    /// Whether this is audio-only
    pub is_audio: bool,
}

/// Format selector with smart quality detection
pub struct FormatSelector;

impl FormatSelector {
    /// Highest-bitrate audio-only stream; AAC wins ties since it drops into
    /// MP4 without surprises. Falls back to any stream that carries audio.
    pub fn select_audio(formats: &[StreamFormat]) -> Option<&StreamFormat> {
        let bitrate = |f: &StreamFormat| (f.abr.or(f.tbr).unwrap_or(0.0) * 100.0) as u32;

        formats
            .iter()
            .filter(|f| f.is_audio_only())
            .max_by_key(|f| (bitrate(*f), Self::is_aac(f)))
            .or_else(|| {
                formats
                    .iter()
                    .filter(|f| f.has_audio())
                    .max_by_key(|f| bitrate(*f))
            })
    }

    /// Video-only MP4 stream labelled `{quality}60`, or else exactly `quality`.
    pub fn select_video<'a>(formats: &'a [StreamFormat], quality: &str) -> Option<&'a StreamFormat> {
        let candidates: Vec<&StreamFormat> = formats
            .iter()
            .filter(|f| f.ext == "mp4" && f.is_video_only())
            .collect();

        let with_label = |label: &str| -> Option<&'a StreamFormat> {
            let matches: Vec<&&StreamFormat> = candidates
                .iter()
                .filter(|f| f.quality_label.as_deref() == Some(label))
                .collect();
            // Prefer H.264 among identical labels, then the bigger stream
            matches
                .iter()
                .max_by_key(|f| (Self::is_h264(f), f.tbr.map(|t| t as u32).unwrap_or(0)))
                .map(|f| **f)
        };

        with_label(&format!("{}60", quality)).or_else(|| with_label(quality))
    }

    /// Menu entries this item can serve, highest quality first, MP3 last
    pub fn build_quality_options(item: &MediaItem) -> Vec<QualityOption> {
        let audio = Self::select_audio(&item.formats);
        let audio_size = audio.and_then(|a| a.filesize).unwrap_or(0);

        let mut options: Vec<QualityOption> = QUALITY_LABELS
            .iter()
            .filter_map(|quality| {
                let video = Self::select_video(&item.formats, quality)?;
                let size = video.filesize.map(|s| s + audio_size);
                let codec = Self::get_codec_label(video);
                let shown = video.quality_label.clone().unwrap_or_else(|| quality.to_string());
                Some(QualityOption {
                    label: match Self::format_size(size) {
                        Some(s) => format!("{} ({}, {})", shown, codec, s),
                        None => format!("{} ({})", shown, codec),
                    },
                    value: quality.to_string(),
                    estimated_size: Self::format_size(size),
                    codec_info: Some(codec),
                    is_audio: false,
                })
            })
            .collect();

        if let Some(audio) = audio {
            options.push(QualityOption {
                label: "Audio Only (MP3)".to_string(),
                value: "mp3".to_string(),
                estimated_size: Self::format_size(audio.filesize),
                codec_info: audio.acodec.clone(),
                is_audio: true,
            });
        }

        options
    }

    fn is_h264(format: &StreamFormat) -> bool {
        format
            .vcodec
            .as_deref()
            .map_or(false, |v| v.starts_with("avc1"))
    }

    fn is_aac(format: &StreamFormat) -> bool {
        format
            .acodec
            .as_deref()
            .map_or(false, |a| a.starts_with("mp4a"))
    }

    /// Format file size for display
    fn format_size(bytes: Option<u64>) -> Option<String> {
        bytes.filter(|b| *b > 0).map(|b| {
            let mb = b as f64 / 1_048_576.0;
            if mb >= 1024.0 {
                format!("{:.1} GB", mb / 1024.0)
            } else {
                format!("{:.0} MB", mb)
            }
        })
    }

    /// Get human-readable codec label
    fn get_codec_label(format: &StreamFormat) -> String {
        let vcodec = format.vcodec.as_deref().unwrap_or("");
        if Self::is_h264(format) {
            "H.264".to_string()
        } else if vcodec.starts_with("vp9") || vcodec.starts_with("vp09") {
            "VP9".to_string()
        } else if vcodec.starts_with("av01") {
            "AV1".to_string()
        } else if vcodec.is_empty() {
            "Unknown".to_string()
        } else {
            vcodec.split('.').next().unwrap_or(vcodec).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str, label: &str, vcodec: &str, ext: &str) -> StreamFormat {
        StreamFormat {
            format_id: id.to_string(),
            ext: ext.to_string(),
            quality_label: Some(label.to_string()),
            vcodec: Some(vcodec.to_string()),
            acodec: Some("none".to_string()),
            filesize: Some(100 * 1_048_576),
            ..Default::default()
        }
    }

    fn audio(id: &str, abr: f32, acodec: &str) -> StreamFormat {
        StreamFormat {
            format_id: id.to_string(),
            ext: "m4a".to_string(),
            vcodec: Some("none".to_string()),
            acodec: Some(acodec.to_string()),
            abr: Some(abr),
            filesize: Some(4 * 1_048_576),
            ..Default::default()
        }
    }

    fn item(formats: Vec<StreamFormat>) -> MediaItem {
        MediaItem {
            source_url: "https://www.youtube.com/watch?v=abc".to_string(),
            id: "abc".to_string(),
            title: "Song".to_string(),
            uploader: "Someone".to_string(),
            duration_seconds: 100,
            formats,
        }
    }

    #[test]
    fn prefers_60fps_variant() {
        let formats = vec![
            video("137", "1080p", "avc1.640028", "mp4"),
            video("299", "1080p60", "avc1.64002a", "mp4"),
        ];
        let picked = FormatSelector::select_video(&formats, "1080p").unwrap();
        assert_eq!(picked.format_id, "299");
    }

    #[test]
    fn exact_label_when_no_60fps() {
        let formats = vec![
            video("136", "720p", "avc1.4d401f", "mp4"),
            video("247", "720p", "vp9", "webm"),
            video("137", "1080p", "avc1.640028", "mp4"),
        ];
        let picked = FormatSelector::select_video(&formats, "720p").unwrap();
        assert_eq!(picked.format_id, "136");
    }

    #[test]
    fn missing_quality_yields_none() {
        let formats = vec![
            video("136", "720p", "avc1.4d401f", "mp4"),
            video("248", "1080p", "vp9", "webm"),
        ];
        assert!(FormatSelector::select_video(&formats, "1080p").is_none());
        assert!(FormatSelector::select_video(&formats, "1440p").is_none());
    }

    #[test]
    fn muxed_streams_are_not_video_only() {
        let mut progressive = video("18", "360p", "avc1.42001E", "mp4");
        progressive.acodec = Some("mp4a.40.2".to_string());
        assert!(FormatSelector::select_video(&[progressive], "360p").is_none());
    }

    #[test]
    fn highest_audio_bitrate_wins() {
        let formats = vec![
            audio("140", 129.5, "mp4a.40.2"),
            audio("251", 160.0, "opus"),
            audio("139", 48.0, "mp4a.40.5"),
        ];
        assert_eq!(FormatSelector::select_audio(&formats).unwrap().format_id, "251");
    }

    #[test]
    fn aac_wins_bitrate_ties() {
        let formats = vec![audio("251", 128.0, "opus"), audio("140", 128.0, "mp4a.40.2")];
        assert_eq!(FormatSelector::select_audio(&formats).unwrap().format_id, "140");
    }

    #[test]
    fn quality_options_list_available_entries() {
        let options = FormatSelector::build_quality_options(&item(vec![
            video("299", "1080p60", "avc1.64002a", "mp4"),
            video("136", "720p", "avc1.4d401f", "mp4"),
            audio("140", 129.5, "mp4a.40.2"),
        ]));

        let values: Vec<&str> = options.iter().map(|o| o.value.as_str()).collect();
        assert_eq!(values, vec!["1080p", "720p", "mp3"]);
        assert_eq!(options[0].label, "1080p60 (H.264, 104 MB)");
        assert!(options.last().unwrap().is_audio);
    }
}
