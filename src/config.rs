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


//! Download manager configuration
//!
//! The mobile shell passes this as JSON to `offline_media_init`; the CLI builds
//! it from flags or loads it with [`ManagerConfig::from_file`]. Every field has
//! a default so partial documents are accepted.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes written between durable flushes (1MB)
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 1024 * 1024;

/// Buffered writer capacity (8KB)
pub const DEFAULT_WRITE_BUFFER: usize = 8 * 1024;

const MANIFEST_FILE_NAME: &str = "manifest.json";

/// What to do when the manifest on disk cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptManifestPolicy {
    /// Move the unreadable file aside and start empty (degraded)
    Reset,
    /// Refuse to start
    Abort,
}

/// Download manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory holding one file per download item
    pub download_dir: PathBuf,

    /// Manifest location (defaults to `<download_dir>/manifest.json`)
    pub manifest_path: Option<PathBuf>,

    /// Minimum interval between progress-driven manifest saves for one item
    pub persist_interval_ms: u64,

    /// Bytes written between flush + fsync (a chunk boundary)
    pub flush_threshold_bytes: u64,

    /// Buffered writer capacity
    pub write_buffer_bytes: usize,

    /// Whole-request timeout
    pub request_timeout_secs: u64,

    /// TCP/TLS connect timeout
    pub connect_timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,

    /// How long to wait for a cancelled transfer to stop
    pub cancel_grace_ms: u64,

    /// Observer channel capacity
    pub event_capacity: usize,

    /// Re-hash the file before handing it to the player
    pub verify_before_playback: bool,

    pub on_corrupt_manifest: CorruptManifestPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            manifest_path: None,
            persist_interval_ms: 1000,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD,
            write_buffer_bytes: DEFAULT_WRITE_BUFFER,
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            cancel_grace_ms: 2000,
            event_capacity: 256,
            verify_before_playback: true,
            on_corrupt_manifest: CorruptManifestPolicy::Reset,
        }
    }
}

impl ManagerConfig {
    /// Default configuration rooted at `download_dir`
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Parse configuration from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CoreError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(CoreError::Configuration("download_dir must not be empty".to_string()));
        }
        if self.persist_interval_ms == 0 {
            return Err(CoreError::Configuration("persist_interval_ms must be positive".to_string()));
        }
        if self.flush_threshold_bytes == 0 {
            return Err(CoreError::Configuration("flush_threshold_bytes must be positive".to_string()));
        }
        if self.write_buffer_bytes == 0 {
            return Err(CoreError::Configuration("write_buffer_bytes must be positive".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(CoreError::Configuration("event_capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// Resolved manifest location
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.download_dir.join(MANIFEST_FILE_NAME))
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
