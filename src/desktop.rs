// Desktop window: the same download core behind Tauri commands.
// Progress registry events are forwarded to the webview as `download-progress`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tauri::{AppHandle, Emitter, State};
use tokio::sync::broadcast::error::RecvError;

use crate::config::AppConfig;
use crate::downloader::format_selector::QualityOption;
use crate::downloader::models::{DownloadOutcome, DownloadRequest, OutputFormat};
use crate::downloader::tools::{ToolInfo, ToolManager};
use crate::downloader::Downloader;
use crate::progress::ProgressRegistry;

pub const PROGRESS_EVENT: &str = "download-progress";

struct DesktopState {
    downloader: Downloader,
    download_dir: PathBuf,
    tools: ToolManager,
}

#[tauri::command]
async fn download(
    url: String,
    format: String,
    state: State<'_, DesktopState>,
) -> Result<DownloadOutcome, String> {
    let format: OutputFormat = format.parse().map_err(|e: crate::DownloadError| e.to_string())?;
    state
        .downloader
        .download(DownloadRequest::new(url, format, state.download_dir.clone()))
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn get_formats(url: String, state: State<'_, DesktopState>) -> Result<Vec<QualityOption>, String> {
    state
        .downloader
        .quality_options(&url)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn get_tools_status(state: State<'_, DesktopState>) -> Result<Vec<ToolInfo>, String> {
    Ok(state.tools.get_all_tools())
}

fn forward_progress(app: AppHandle, progress: &ProgressRegistry) {
    let mut rx = progress.subscribe();
    tauri::async_runtime::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = app.emit(PROGRESS_EVENT, &event) {
                        tracing::warn!("[Desktop] failed to emit progress: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("[Desktop] skipped {} progress events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Open the window and block until it is closed. Must run on the main thread.
pub fn run() -> Result<()> {
    let cfg = AppConfig::load()?;
    let progress = ProgressRegistry::new(cfg.hide_check());
    let downloader = Downloader::from_config(&cfg, progress.clone())?;
    let state = DesktopState {
        downloader,
        download_dir: cfg.download_dir(),
        tools: ToolManager::from_config(&cfg),
    };

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .manage(state)
        .setup(move |app| {
            forward_progress(app.handle().clone(), &progress);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![download, get_formats, get_tools_status])
        .run(tauri::generate_context!())
        .context("error while running tauri application")
}
