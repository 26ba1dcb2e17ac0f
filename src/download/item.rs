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


//! Download item record and lifecycle states
//!
//! # Invariants
//! - `bytes_written <= expected_size` whenever the size is known
//! - `Complete` implies `checksum` is set and `bytes_written == expected_size`
//! - `InProgress` implies exactly one live transfer bound to the id

use crate::error::ErrorRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a download item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created, transfer not started yet
    Pending,
    /// Exactly one transfer is moving bytes for this item
    InProgress,
    /// Stopped by the operator; resumable
    Paused,
    /// All bytes present and checksum verified
    Complete,
    /// Transfer or verification failed; see `last_error`
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::InProgress => "in_progress",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional extras for a download request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Name shown in the downloads list
    pub display_name: Option<String>,
    /// Known SHA-256 of the content; completion fails if it differs
    pub expected_checksum: Option<String>,
}

/// One known download, keyed by `id` in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: String,
    pub source_url: String,
    pub local_path: PathBuf,
    pub display_name: Option<String>,
    pub expected_size: Option<u64>,
    pub bytes_written: u64,
    pub checksum: Option<String>,
    pub expected_checksum: Option<String>,
    pub status: DownloadStatus,
    pub last_error: Option<ErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadItem {
    /// New item in `Pending`
    pub fn new(id: String, source_url: String, local_path: PathBuf, options: RequestOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_url,
            local_path,
            display_name: options.display_name,
            expected_size: None,
            bytes_written: 0,
            checksum: None,
            expected_checksum: options.expected_checksum,
            status: DownloadStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Name for display, falling back to the id
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Stamp `updated_at`; called on every mutation
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Calculate download percentage
    pub fn progress_percentage(&self) -> f64 {
        match self.expected_size {
            Some(total) if total > 0 => (self.bytes_written as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Forget partial data so the next transfer starts from byte zero
    pub fn reset_progress(&mut self) {
        self.bytes_written = 0;
        self.expected_size = None;
        self.checksum = None;
        self.touch();
    }

    /// The next request must discard the partial file
    pub fn needs_restart(&self) -> bool {
        self.status == DownloadStatus::Failed
            && self.last_error.as_ref().map_or(false, |e| e.forces_restart())
    }
}
