use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

use super::errors::DownloadError;
use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolType {
    YtDlp,
    Ffmpeg,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "yt-dlp",
            ToolType::Ffmpeg => "ffmpeg",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "--version",
            ToolType::Ffmpeg => "-version", // ffmpeg takes a single dash
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub tool_type: ToolType,
    pub version: Option<String>,
    pub path: Option<String>,
    pub is_available: bool,
}

/// Finds yt-dlp and ffmpeg: configured path, common install dirs, then PATH.
#[derive(Debug, Clone, Default)]
pub struct ToolManager {
    ytdlp_path: Option<String>,
    ffmpeg_path: Option<String>,
}

impl ToolManager {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ytdlp_path: config.ytdlp_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
        }
    }

    pub fn get_tool_info(&self, tool_type: ToolType) -> ToolInfo {
        let path = self.detect_tool(tool_type);
        let version = path.as_deref().and_then(|p| self.get_version(p, tool_type));

        ToolInfo {
            name: tool_type.as_str().to_string(),
            tool_type,
            version,
            is_available: path.is_some(),
            path,
        }
    }

    pub fn get_all_tools(&self) -> Vec<ToolInfo> {
        vec![
            self.get_tool_info(ToolType::YtDlp),
            self.get_tool_info(ToolType::Ffmpeg),
        ]
    }

    /// Path to run for `tool_type`, or `ToolNotFound`
    pub fn resolve_binary(&self, tool_type: ToolType) -> Result<String, DownloadError> {
        self.detect_tool(tool_type).ok_or_else(|| {
            DownloadError::ToolNotFound(format!(
                "{} (install it or set {}_path in config.toml)",
                tool_type.as_str(),
                match tool_type {
                    ToolType::YtDlp => "ytdlp",
                    ToolType::Ffmpeg => "ffmpeg",
                }
            ))
        })
    }

    fn configured(&self, tool_type: ToolType) -> Option<&str> {
        match tool_type {
            ToolType::YtDlp => self.ytdlp_path.as_deref(),
            ToolType::Ffmpeg => self.ffmpeg_path.as_deref(),
        }
    }

    fn detect_tool(&self, tool_type: ToolType) -> Option<String> {
        let mut binary_name = tool_type.as_str();

        // 1. Configured path; a bare name is searched like the default one
        if let Some(configured) = self.configured(tool_type) {
            if Path::new(configured).is_file() {
                return Some(configured.to_string());
            }
            if configured.contains(std::path::MAIN_SEPARATOR) {
                tracing::warn!("[Tools] configured {} not found at {}", binary_name, configured);
                return None;
            }
            binary_name = configured;
        }

        // 2. Try common paths first
        let common_paths = [
            format!("/opt/homebrew/bin/{}", binary_name),
            format!("/usr/local/bin/{}", binary_name),
            format!("/usr/bin/{}", binary_name),
        ];

        for path in common_paths {
            if Path::new(&path).exists() {
                return Some(path);
            }
        }

        // 3. Try PATH
        let finder = if cfg!(windows) { "where" } else { "which" };
        if let Ok(output) = Command::new(finder).arg(binary_name).output() {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(path) = stdout.lines().next().map(str::trim).filter(|p| !p.is_empty()) {
                    return Some(path.to_string());
                }
            }
        }

        None
    }

    fn get_version(&self, path: &str, tool_type: ToolType) -> Option<String> {
        match Command::new(path).arg(tool_type.version_arg()).output() {
            Ok(output) if output.status.success() => {
                parse_version(tool_type, &String::from_utf8_lossy(&output.stdout))
            }
            _ => None,
        }
    }
}

/// yt-dlp prints just the version; ffmpeg prints "ffmpeg version 6.1.1 Copyright ..."
fn parse_version(tool_type: ToolType, stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?.trim();
    match tool_type {
        ToolType::YtDlp => Some(first.to_string()).filter(|v| !v.is_empty()),
        ToolType::Ffmpeg => first
            .strip_prefix("ffmpeg version ")
            .and_then(|rest| rest.split_whitespace().next())
            .map(|v| v.to_string()),
    }
}
