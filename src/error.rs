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


//! Error types for the offline media core
//!
//! # Error Categories
//!
//! ### Transfer (from `download::transfer`, `download::remote`)
//! - Unreachable host, timeout, non-2xx status → `Network` (transient unless a 4xx)
//! - Advertised length contradicts a resumed transfer → `SizeMismatch`
//!
//! ### Local storage (from `file`, `download::transfer`)
//! - No space, permission denied, failed write/flush → `Disk`
//!
//! ### Completion
//! - Recomputed checksum differs from the reported one → `Integrity`
//!
//! ### Durable state (from `download::manifest`)
//! - Manifest bytes cannot be decoded → `CorruptManifest`
//!
//! Transfer-level errors never escape the manager: they are converted into a
//! `Failed` status plus an [`ErrorRecord`] stored on the item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using our CoreError type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for the offline media core
#[derive(Error, Debug)]
pub enum CoreError {
    // ===== Transfer Errors =====

    /// Remote source unreachable, timed out, or answered with a non-2xx status
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Whether a later retry may succeed
        is_transient: bool,
        /// HTTP status code if the server answered
        status_code: Option<u16>,
    },

    /// Server's advertised length contradicts what a resumed transfer expects
    #[error("Size mismatch: expected {expected} bytes, server reports {actual} bytes")]
    SizeMismatch {
        expected: u64,
        actual: u64,
    },

    /// Downloaded content does not hash to the reported checksum
    #[error("Integrity check failed for {}: expected {expected}, got {actual}", path.display())]
    Integrity {
        expected: String,
        actual: String,
        path: PathBuf,
    },

    // ===== Storage Errors =====

    /// Local disk failure (no space, permission, failed write)
    #[error("Disk error at {}: {message}", path.display())]
    Disk {
        message: String,
        path: PathBuf,
    },

    /// Durable manifest could not be decoded
    #[error("Corrupt manifest at {}: {message}", path.display())]
    CorruptManifest {
        path: PathBuf,
        message: String,
    },

    // ===== State Errors =====

    /// No download item with the given id
    #[error("Download not found: {0}")]
    NotFound(String),

    /// Invalid caller input (bad URL, immutable field changed)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the item's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Item cannot be handed to the player yet
    #[error("Not playable: {id} ({reason})")]
    NotPlayable {
        id: String,
        reason: String,
    },

    /// Configuration is invalid or could not be loaded
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    Internal(String),

    // ===== External Library Errors =====

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        let is_transient = err.is_timeout()
            || err.is_connect()
            || err.is_body()
            || err.is_request()
            || status_code.map(is_transient_status).unwrap_or(false);

        CoreError::Network {
            message: err.to_string(),
            is_transient,
            status_code,
        }
    }
}

/// 408, 429 and 5xx are worth retrying; other statuses are not
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Coarse error category persisted with failed items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Disk,
    SizeMismatch,
    Integrity,
    CorruptManifest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Disk => "disk",
            ErrorKind::SizeMismatch => "size_mismatch",
            ErrorKind::Integrity => "integrity",
            ErrorKind::CorruptManifest => "corrupt_manifest",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Structured error attached to a failed download item
///
/// This is what the UI reads after a `StatusChanged` event to render a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(err: &CoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
            retryable: err.is_retryable(),
            occurred_at: Utc::now(),
        }
    }

    /// The next request must start over from byte zero
    pub fn forces_restart(&self) -> bool {
        matches!(self.kind, ErrorKind::SizeMismatch | ErrorKind::Integrity)
    }
}

// Helper methods for creating common errors
impl CoreError {
    /// Create a Network error
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        CoreError::Network {
            message: message.into(),
            is_transient,
            status_code: None,
        }
    }

    /// Create a Network error from an HTTP status
    pub fn http_status(status: u16, url: &str) -> Self {
        CoreError::Network {
            message: format!("HTTP {} from {}", status, url),
            is_transient: is_transient_status(status),
            status_code: Some(status),
        }
    }

    /// Create a Disk error for the given path
    pub fn disk<S: Into<String>>(path: &Path, message: S) -> Self {
        CoreError::Disk {
            message: message.into(),
            path: path.to_path_buf(),
        }
    }

    /// Wrap an I/O failure on `path` as a Disk error
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        Self::disk(path, err.to_string())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        CoreError::InvalidInput(message.into())
    }

    /// Create an Internal error with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        CoreError::Internal(message.into())
    }

    /// Create a NotPlayable error
    pub fn not_playable<S: Into<String>>(id: &str, reason: S) -> Self {
        CoreError::NotPlayable {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Category used for the persisted error record
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Network { .. } => ErrorKind::Network,
            CoreError::Disk { .. } | CoreError::Io(_) => ErrorKind::Disk,
            CoreError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            CoreError::Integrity { .. } => ErrorKind::Integrity,
            CoreError::CorruptManifest { .. } | CoreError::SerdeJson(_) => {
                ErrorKind::CorruptManifest
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Check if a later retry may succeed without operator action
    ///
    /// Only transient network errors qualify. Disk errors are surfaced and
    /// never retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Network { is_transient: true, .. })
    }

    /// Whether the next attempt has to discard the partial file
    pub fn forces_restart(&self) -> bool {
        matches!(self, CoreError::SizeMismatch { .. } | CoreError::Integrity { .. })
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            CoreError::Network { is_transient: true, .. } => {
                format!("{}. Check your connection and try again.", self)
            }
            CoreError::Network { status_code: Some(404), .. } => {
                "The video is no longer available on the server.".to_string()
            }
            CoreError::SizeMismatch { .. } => {
                "The file changed on the server. It will be downloaded again from the start."
                    .to_string()
            }
            CoreError::Integrity { .. } => {
                "Download verification failed. Please download the video again.".to_string()
            }
            CoreError::Disk { message, .. } => {
                format!("Could not write the video to storage: {}", message)
            }
            CoreError::CorruptManifest { .. } => {
                "Saved download list could not be read and was reset.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
