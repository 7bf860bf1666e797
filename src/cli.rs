//! Command line front-end for tubefetch.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::downloader::models::{DownloadOutcome, DownloadRequest, OutputFormat};
use crate::downloader::tools::ToolManager;
use crate::downloader::Downloader;
use crate::progress::terminal::spawn_terminal_display;
use crate::progress::ProgressRegistry;

#[derive(Debug, Parser)]
#[command(name = "tubefetch")]
#[command(about = "Download videos and playlists as MP3 or MP4", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download a video or a whole playlist (any URL with `list=`).
    Download {
        /// Video or playlist URL.
        url: String,
        /// mp3 (or audio), 2160p, 1440p, 1080p, 720p, 480p or 360p. Defaults to default_quality from config.
        #[arg(short, long, value_name = "FORMAT")]
        format: Option<String>,
        /// Directory to write into. Defaults to download_dir from config, else Downloads.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// List the formats a video is available in.
    Formats {
        /// Video URL.
        url: String,
    },

    /// Show where yt-dlp and ffmpeg were found and their versions.
    Tools,

    /// Open the desktop window.
    #[cfg(feature = "desktop")]
    Gui,
}

impl CliCommand {
    pub async fn run(self) -> Result<()> {
        let cfg = AppConfig::load()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match self {
            CliCommand::Download { url, format, output } => {
                let format = match format {
                    Some(tag) => tag.parse::<OutputFormat>()?,
                    None => cfg.default_format()?,
                };
                let destination = output.unwrap_or_else(|| cfg.download_dir());
                run_download(&cfg, url, format, destination).await
            }
            CliCommand::Formats { url } => run_formats(&cfg, &url).await,
            CliCommand::Tools => {
                run_tools(&cfg);
                Ok(())
            }
            #[cfg(feature = "desktop")]
            CliCommand::Gui => bail!("the desktop window needs the main thread, start it with desktop::run()"),
        }
    }
}

async fn run_download(
    cfg: &AppConfig,
    url: String,
    format: OutputFormat,
    destination: PathBuf,
) -> Result<()> {
    let progress = ProgressRegistry::new(cfg.hide_check());
    let downloader = Downloader::from_config(cfg, progress.clone())?;
    let display = spawn_terminal_display(&progress);

    let token = downloader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            token.cancel();
        }
    });

    let outcome = downloader
        .download(DownloadRequest::new(url.clone(), format, destination))
        .await;

    // Let finished bars fade out before printing over them
    progress.wait_until_empty().await;
    display.abort();

    match outcome.with_context(|| format!("downloading {}", url))? {
        DownloadOutcome::Item { path } => {
            println!("Saved {}", path.display());
        }
        DownloadOutcome::Playlist(summary) => {
            println!(
                "{}: {}/{} downloaded into {}",
                summary.title,
                summary.succeeded.len(),
                summary.total(),
                summary.directory.display()
            );
            for (entry, error) in &summary.failed {
                eprintln!("  failed {}: {}", entry, error);
            }
            if !summary.all_succeeded() {
                bail!(
                    "{} of {} playlist items failed",
                    summary.failed.len(),
                    summary.total()
                );
            }
        }
    }
    Ok(())
}

async fn run_formats(cfg: &AppConfig, url: &str) -> Result<()> {
    let downloader = Downloader::from_config(cfg, ProgressRegistry::new(cfg.hide_check()))?;
    let options = downloader.quality_options(url).await?;
    if options.is_empty() {
        println!("No downloadable formats");
    }
    for option in options {
        println!("{:>6}  {}", option.value, option.label);
    }
    Ok(())
}

fn run_tools(cfg: &AppConfig) {
    for tool in ToolManager::from_config(cfg).get_all_tools() {
        match (&tool.path, &tool.version) {
            (Some(path), version) => println!(
                "{:<7} {} ({})",
                tool.name,
                version.as_deref().unwrap_or("unknown version"),
                path
            ),
            (None, _) => println!("{:<7} not found", tool.name),
        }
    }
}
