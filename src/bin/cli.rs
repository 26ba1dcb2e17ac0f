// Offline Media Core - resumable media downloads for mobile playback
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offline_media_core::download::progress::DownloadProgress;
use offline_media_core::{
    DownloadEvent, DownloadManager, DownloadStatus, ManagerConfig, MediaPlayer,
    PlaybackController, PlaybackHandle, RequestOptions,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offline-media-cli")]
#[command(about = "Offline media CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Download directory (holds the manifest and one file per item)
    #[arg(short, long, default_value = "downloads")]
    dir: PathBuf,

    /// JSON configuration file; `--dir` overrides its download_dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download (or resume) a video; Ctrl-C pauses it
    Get {
        /// Stable item id
        id: String,
        /// Source URL
        url: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        /// Expected SHA-256 of the content
        #[arg(long)]
        sha256: Option<String>,
    },
    /// List known downloads, most recent first
    List,
    /// Delete a download and its file
    Delete {
        id: String,
    },
    /// Verify a completed download and hand it to the player
    Play {
        id: String,
    },
}

/// Stand-in player that reports what it would play
struct PrintPlayer;

impl MediaPlayer for PrintPlayer {
    fn play(&self, handle: &PlaybackHandle) -> offline_media_core::Result<()> {
        println!("▶️  {} ({})", handle.name, DownloadProgress::bytes_string(handle.size));
        println!("   {}", handle.path.display());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ManagerConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    config.download_dir = cli.dir.clone();

    let manager = DownloadManager::start(config)
        .await
        .context("Failed to start download manager")?;

    let health = manager.health().await?;
    if health.is_degraded() {
        eprintln!("⚠️  {:?}", health);
    }

    let result = run(&manager, cli.command).await;
    manager.shutdown().await?;
    result
}

async fn run(manager: &DownloadManager, command: Commands) -> Result<()> {
    match command {
        Commands::Get {
            id,
            url,
            name,
            sha256,
        } => get(manager, id, url, name, sha256).await,
        Commands::List => {
            let items = manager.list().await?;
            if items.is_empty() {
                println!("No downloads");
            }
            for item in items {
                let size = item
                    .expected_size
                    .map(DownloadProgress::bytes_string)
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:<12} {:<12} {:>6.1}% of {:<10} {}",
                    item.id,
                    item.status.as_str(),
                    item.progress_percentage(),
                    size,
                    item.name()
                );
                if let Some(error) = &item.last_error {
                    println!("             └ {}", error.message);
                }
            }
            Ok(())
        }
        Commands::Delete { id } => {
            let report = manager.delete(&id).await?;
            match report.file_error {
                Some(error) => println!("Deleted {} (file left behind: {})", id, error),
                None if report.file_removed => println!("Deleted {}", id),
                None => println!("Deleted {} (no file on disk)", id),
            }
            Ok(())
        }
        Commands::Play { id } => {
            let handle = manager.playback(&id).await?;
            let mut controller = PlaybackController::new(PrintPlayer);
            controller.open(handle)?;
            controller.close();
            Ok(())
        }
    }
}

async fn get(
    manager: &DownloadManager,
    id: String,
    url: String,
    name: Option<String>,
    sha256: Option<String>,
) -> Result<()> {
    // Subscribe first so no transition is missed
    let mut events = manager.subscribe();

    let options = RequestOptions {
        display_name: name,
        expected_checksum: sha256,
    };
    let item = manager.request_with(&id, &url, options).await?;
    if item.status == DownloadStatus::Complete {
        println!("✅ {} is already downloaded", item.name());
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DownloadEvent::Progress(progress)) if progress.id == id => {
                    print!("\r{:<100}", progress.display_string());
                    std::io::stdout().flush().ok();
                }
                Ok(DownloadEvent::StatusChanged { id: changed, new, error, .. }) if changed == id => {
                    match new {
                        DownloadStatus::Complete => {
                            println!("\n✅ Download complete");
                            return Ok(());
                        }
                        DownloadStatus::Paused => {
                            println!("\n⏸️  Paused; run the same command again to resume");
                            return Ok(());
                        }
                        DownloadStatus::Failed => {
                            let message = error.map(|e| e.message).unwrap_or_default();
                            println!();
                            bail!("Download failed: {}", message);
                        }
                        _ => {}
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Download manager stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                manager.cancel(&id).await?;
            }
        }
    }
}
