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


//! File operations used by the manifest and the download manager
//!
//! # Key Operations
//! - Atomic, durable writes (temp file, fsync, rename, fsync directory)
//! - Deletes with retry (mobile file providers briefly hold handles)
//! - Existence and size probes
//! - Directory creation

use crate::error::{CoreError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// File manager for safe file operations under one root directory
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Safe delete with retry; a missing file is not an error
    ///
    /// Returns `true` if a file was removed. Paths outside the root are refused.
    pub async fn safe_delete(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) {
            return Err(CoreError::invalid_input(format!(
                "Refusing to delete {} outside {}",
                path.display(),
                self.root.display()
            )));
        }

        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::safe_delete_once(path).await {
                Ok(removed) => return Ok(removed),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(CoreError::disk(
                        path,
                        format!("Failed to delete after {} attempts: {}", MAX_RETRY_ATTEMPTS, e),
                    ));
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Delete failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn safe_delete_once(path: &Path) -> std::io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ensure directory exists, creating parent directories as needed
    pub async fn ensure_directory_exists(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| CoreError::disk(path, format!("Failed to create directory: {}", e)))
    }

    /// Check if file exists
    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Size of the file at `path`, `None` if it does not exist
    pub async fn file_size(path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::from_io(path, e)),
        }
    }

    /// Atomic write: write to temp file, fsync, rename over `path`, fsync the directory
    ///
    /// After this returns `Ok`, a crash leaves either the old or the new
    /// contents at `path`, never a torn mix.
    pub async fn atomic_write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = temp_path_for(path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| CoreError::disk(&temp_path, format!("Failed to create temp file: {}", e)))?;

        file.write_all(contents)
            .await
            .map_err(|e| CoreError::disk(&temp_path, format!("Failed to write temp file: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| CoreError::disk(&temp_path, format!("Failed to sync temp file: {}", e)))?;

        drop(file);

        fs::rename(&temp_path, path).await.map_err(|e| {
            CoreError::disk(
                path,
                format!("Failed to rename {} into place: {}", temp_path.display(), e),
            )
        })?;

        if let Some(parent) = path.parent() {
            sync_directory(parent).await;
        }

        Ok(())
    }

    /// Move `path` aside to `<name>.<suffix>`, returning the new location
    pub async fn quarantine(&self, path: &Path, suffix: &str) -> Result<PathBuf> {
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let target = path.with_file_name(format!("{}.{}", file_name, suffix));

        fs::rename(path, &target).await.map_err(|e| {
            CoreError::disk(path, format!("Failed to move aside to {}: {}", target.display(), e))
        })?;

        Ok(target)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    path.with_file_name(format!(".{}.tmp", file_name))
}

// Directory fsync makes the rename itself durable; not supported everywhere.
#[cfg(unix)]
async fn sync_directory(dir: &Path) {
    match fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                warn!(dir = %dir.display(), error = %e, "Directory fsync failed");
            }
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "Could not open directory for fsync"),
    }
}

#[cfg(not(unix))]
async fn sync_directory(_dir: &Path) {}
