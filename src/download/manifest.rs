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


//! Durable manifest of known download items
//!
//! The manifest is a single JSON document mapping id to item:
//!
//! ```json
//! { "version": 1, "items": { "v1": { "id": "v1", "status": "complete", ... } } }
//! ```
//!
//! The store keeps the mapping in memory and exposes per-record upsert and
//! delete. Each call rewrites the document atomically and fsyncs before
//! returning, under a mutex, so two writers can never lose each other's
//! records the way a read-modify-write of the whole blob would.

use crate::download::item::DownloadItem;
use crate::error::{CoreError, Result};
use crate::file::FileManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    items: BTreeMap<String, DownloadItem>,
}

/// Durable key-value store of download items
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    files: FileManager,
    items: Mutex<BTreeMap<String, DownloadItem>>,
}

impl ManifestStore {
    /// Store backed by the document at `path`; nothing is read until [`load`](Self::load)
    pub fn new(path: PathBuf) -> Self {
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            path,
            files: FileManager::new(root),
            items: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read durable state
    ///
    /// Returns an empty mapping if no manifest exists yet. Fails with
    /// `CorruptManifest` if the document cannot be decoded; the in-memory
    /// mapping is left untouched so the caller can choose to reset or abort.
    pub async fn load(&self) -> Result<BTreeMap<String, DownloadItem>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No manifest yet, starting empty");
                let mut items = self.items.lock().await;
                items.clear();
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(CoreError::from_io(&self.path, e)),
        };

        let document = decode(&self.path, &bytes)?;

        let mut items = self.items.lock().await;
        *items = document.items.clone();
        info!(path = %self.path.display(), count = items.len(), "Loaded manifest");

        Ok(document.items)
    }

    /// Upsert one record and flush durably before returning
    pub async fn save(&self, item: &DownloadItem) -> Result<()> {
        let mut items = self.items.lock().await;
        let previous = items.insert(item.id.clone(), item.clone());

        if let Err(e) = self.write_locked(&items).await {
            // Keep memory in step with what is on disk
            match previous {
                Some(prev) => items.insert(item.id.clone(), prev),
                None => items.remove(&item.id),
            };
            return Err(e);
        }

        Ok(())
    }

    /// Remove one record; absent ids are a no-op
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut items = self.items.lock().await;
        let Some(previous) = items.remove(id) else {
            return Ok(());
        };

        if let Err(e) = self.write_locked(&items).await {
            items.insert(id.to_string(), previous);
            return Err(e);
        }

        Ok(())
    }

    /// Forget everything and write an empty document
    pub async fn reset(&self) -> Result<()> {
        let mut items = self.items.lock().await;
        items.clear();
        self.write_locked(&items).await
    }

    /// Move an unreadable manifest aside so a fresh one can be written
    pub async fn quarantine(&self) -> Result<PathBuf> {
        let suffix = format!("corrupt-{}", chrono::Utc::now().timestamp());
        self.files.quarantine(&self.path, &suffix).await
    }

    async fn write_locked(&self, items: &BTreeMap<String, DownloadItem>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                self.files.ensure_directory_exists(parent).await?;
            }
        }

        let document = ManifestDocumentRef {
            version: MANIFEST_VERSION,
            items,
        };
        let json = serde_json::to_vec_pretty(&document)?;
        self.files.atomic_write(&self.path, &json).await
    }
}

#[derive(Serialize)]
struct ManifestDocumentRef<'a> {
    version: u32,
    items: &'a BTreeMap<String, DownloadItem>,
}

fn decode(path: &Path, bytes: &[u8]) -> Result<ManifestDocument> {
    let document: ManifestDocument =
        serde_json::from_slice(bytes).map_err(|e| CoreError::CorruptManifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if document.version > MANIFEST_VERSION {
        return Err(CoreError::CorruptManifest {
            path: path.to_path_buf(),
            message: format!("Unsupported manifest version {}", document.version),
        });
    }

    for (key, item) in &document.items {
        if key != &item.id {
            return Err(CoreError::CorruptManifest {
                path: path.to_path_buf(),
                message: format!("Record keyed '{}' carries id '{}'", key, item.id),
            });
        }
    }

    Ok(document)
}
