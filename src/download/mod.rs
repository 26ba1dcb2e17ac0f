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


//! Download management and streaming
//!
//! - [`item`] - the record kept per download and its lifecycle states
//! - [`manifest`] - durable id → item mapping
//! - [`remote`] - remote source contract and the HTTP implementation
//! - [`transfer`] - one resumable, cancellable transfer to a local file
//! - [`progress`] - progress snapshots and speed estimation
//! - [`manager`] - orchestration, state machine and events

pub mod item;
pub mod manager;
pub mod manifest;
pub mod progress;
pub mod remote;
pub mod transfer;

// Re-export commonly used types
pub use item::{DownloadItem, DownloadStatus, RequestOptions};
pub use manager::{DeleteReport, DownloadEvent, DownloadManager, ManifestHealth};
pub use manifest::ManifestStore;
pub use progress::DownloadProgress;
pub use remote::{HttpSource, RemoteResponse, RemoteSource};
