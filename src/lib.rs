//! Offline Media Core
//!
//! Resumable, integrity-checked downloads of media files for offline
//! playback, with a durable manifest of what is on the device.
//!
//! - [`download`] - manifest, transfers and the [`DownloadManager`]
//! - [`playback`] - handoff of verified files to a media player
//! - [`file`] - local paths, durable writes and checksums
//! - [`ffi_bridge`] - JSON-over-C API for the mobile shell

pub mod config;
pub mod download;
pub mod error;
pub mod ffi_bridge;
pub mod file;
pub mod playback;

pub use config::{CorruptManifestPolicy, ManagerConfig};
pub use download::{
    DeleteReport, DownloadEvent, DownloadItem, DownloadManager, DownloadProgress, DownloadStatus,
    ManifestHealth, RemoteSource, RequestOptions,
};
pub use error::{CoreError, ErrorKind, ErrorRecord, Result};
pub use playback::{MediaPlayer, PlaybackController, PlaybackEvent, PlaybackHandle};
