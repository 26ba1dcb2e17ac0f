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


//! File management and path utilities
//!
//! Local files are the only storage the core touches besides the manifest:
//! one file per download item at a path derived from its id, written with
//! append/truncate for resume, hashed at completion, and removed on delete.

pub mod checksum;
pub mod manager;
pub mod paths;

// Re-export commonly used types
pub use checksum::sha256_file;
pub use manager::FileManager;
pub use paths::local_path_for;
