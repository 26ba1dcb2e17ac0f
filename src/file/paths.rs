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


//! Deterministic local paths for download items
//!
//! `localPath` is a pure function of the item id: the same id always maps to
//! the same file, so a restarted process finds its partial data again. Ids
//! that are already safe filenames (`OB00136.mp4`) are used verbatim. Ids that
//! needed sanitising get a short hash of the original id appended, so two ids
//! that sanitise to the same text never share a file.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// 255 bytes on every filesystem we ship on
const MAX_COMPONENT_LENGTH: usize = 255;

// Room for "-" + 8 hex chars
const HASH_SUFFIX_LENGTH: usize = 9;

/// Path of the backing file for `id` inside `download_dir`
pub fn local_path_for(download_dir: &Path, id: &str) -> PathBuf {
    download_dir.join(file_name_for(id))
}

/// File name (no directory) for `id`
pub fn file_name_for(id: &str) -> String {
    let sanitized = sanitize_filename(id);
    if sanitized == id && sanitized.len() <= MAX_COMPONENT_LENGTH {
        return sanitized;
    }

    let digest = Sha256::digest(id.as_bytes());
    let suffix = hex::encode(&digest[..4]);

    let (stem, extension) = split_extension(&sanitized);
    let budget = MAX_COMPONENT_LENGTH - HASH_SUFFIX_LENGTH - extension.map_or(0, |e| e.len() + 1);
    let stem = truncate_component(stem, budget);

    match extension {
        Some(ext) => format!("{}-{}.{}", stem, suffix, ext),
        None => format!("{}-{}", stem, suffix),
    }
}

/// Sanitize filename (replaces characters that are invalid in filenames)
pub fn sanitize_filename(name: &str) -> String {
    let mut result: String = name.chars().map(replace_char).collect();

    // Trim leading/trailing whitespace and dots
    result = result.trim().trim_matches('.').to_string();

    if cfg!(target_os = "windows") {
        result = handle_windows_reserved_names(&result);
    }

    if result.is_empty() {
        result = "item".to_string();
    }

    result
}

fn replace_char(c: char) -> char {
    match c {
        '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
        c if c.is_control() => '_',
        c => c,
    }
}

fn handle_windows_reserved_names(name: &str) -> String {
    let upper = name.to_uppercase();
    let stem = upper.split('.').next().unwrap_or("");
    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    if reserved.contains(&stem) {
        format!("_{}", name)
    } else {
        name.to_string()
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        // Short alphanumeric tails only; "v1.part-2" is not an extension
        Some(idx)
            if idx > 0
                && name.len() - idx - 1 <= 8
                && name[idx + 1..].chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (&name[..idx], Some(&name[idx + 1..]))
        }
        _ => (name, None),
    }
}

/// Truncate text to at most `max_bytes` bytes on a char boundary
pub fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut index = max_bytes;
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    text[..index].to_string()
}
