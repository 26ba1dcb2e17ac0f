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


//! Handoff of verified local files to a media player
//!
//! The player itself lives outside the core. The core only guarantees that
//! a [`PlaybackHandle`] exists for an item whose bytes are all present and
//! intact; the player consumes `handle.path` and reports back through
//! [`PlaybackEvent`].

use crate::download::item::{DownloadItem, DownloadStatus};
use crate::error::{CoreError, Result};
use crate::file::checksum::{checksums_match, sha256_file};
use crate::file::FileManager;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info};

/// Validated local file ready for playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackHandle {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

impl PlaybackHandle {
    /// Check that `item` can be played and build its handle
    ///
    /// With `verify` set the file is hashed again; a mismatch is an
    /// `Integrity` error.
    pub async fn prepare(item: &DownloadItem, verify: bool) -> Result<Self> {
        if item.status != DownloadStatus::Complete {
            return Err(CoreError::not_playable(
                &item.id,
                format!("download is {}", item.status),
            ));
        }

        let Some(checksum) = item.checksum.clone() else {
            return Err(CoreError::not_playable(&item.id, "no verified checksum"));
        };

        let size = match FileManager::file_size(&item.local_path).await? {
            Some(size) => size,
            None => return Err(CoreError::not_playable(&item.id, "file is missing")),
        };
        if size != item.bytes_written {
            return Err(CoreError::not_playable(
                &item.id,
                format!("file has {} bytes, expected {}", size, item.bytes_written),
            ));
        }

        if verify {
            let actual = sha256_file(&item.local_path).await?;
            if !checksums_match(&actual, &checksum) {
                return Err(CoreError::Integrity {
                    expected: checksum,
                    actual,
                    path: item.local_path.clone(),
                });
            }
        }

        Ok(Self {
            id: item.id.clone(),
            name: item.name().to_string(),
            path: item.local_path.clone(),
            size,
            checksum,
        })
    }
}

/// Event reported by the player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum PlaybackEvent {
    Ended,
    Error(String),
}

/// External media player
pub trait MediaPlayer: Send + Sync {
    fn play(&self, handle: &PlaybackHandle) -> Result<()>;

    fn stop(&self) {}
}

/// Tracks the one selected video
#[derive(Debug)]
pub struct PlaybackController<P: MediaPlayer> {
    player: P,
    selected: Option<PlaybackHandle>,
}

impl<P: MediaPlayer> PlaybackController<P> {
    pub fn new(player: P) -> Self {
        Self {
            player,
            selected: None,
        }
    }

    /// Hand `handle` to the player, replacing any current selection
    pub fn open(&mut self, handle: PlaybackHandle) -> Result<()> {
        if self.selected.take().is_some() {
            self.player.stop();
        }

        self.player.play(&handle)?;
        info!(id = %handle.id, path = %handle.path.display(), "Playback started");
        self.selected = Some(handle);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.selected.take() {
            self.player.stop();
            info!(id = %handle.id, "Playback closed");
        }
    }

    pub fn on_event(&mut self, event: PlaybackEvent) {
        let Some(handle) = self.selected.take() else {
            return;
        };

        match event {
            PlaybackEvent::Ended => info!(id = %handle.id, "Playback ended"),
            PlaybackEvent::Error(message) => {
                error!(id = %handle.id, error = %message, "Playback failed")
            }
        }
    }

    pub fn selected(&self) -> Option<&PlaybackHandle> {
        self.selected.as_ref()
    }

    pub fn player(&self) -> &P {
        &self.player
    }
}
