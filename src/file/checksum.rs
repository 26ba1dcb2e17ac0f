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


//! Whole-file SHA-256
//!
//! Hashing a multi-hundred-megabyte video is blocking work, so it runs on the
//! blocking pool and only the calling task waits for it.

use crate::error::{CoreError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of the file at `path`
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_blocking(&path))
        .await
        .map_err(|e| CoreError::internal(format!("Checksum task failed: {}", e)))?
}

fn hash_blocking(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| CoreError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).map_err(|e| CoreError::from_io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Case-insensitive comparison of two hex digests
pub fn checksums_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
