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


//! Download progress snapshots and speed estimation
//!
//! # Progress Information
//! - Item id and display name
//! - Bytes written / expected bytes (if the server said)
//! - Current speed with a moving average
//! - Estimated time remaining
//! - Percentage complete

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

/// Progress snapshot for a single download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub id: String,

    /// Name for display
    pub name: String,

    /// Bytes durably written so far
    pub bytes_written: u64,

    /// Total bytes, if known
    pub expected_size: Option<u64>,

    /// Percentage complete (0.0 - 100.0, 0 if size unknown)
    pub percent_complete: f64,

    /// Moving-average speed in bytes per second
    pub speed_bps: f64,

    /// Estimated seconds remaining, if it can be estimated
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    pub fn new(id: String, name: String, bytes_written: u64, expected_size: Option<u64>) -> Self {
        let mut progress = Self {
            id,
            name,
            bytes_written,
            expected_size,
            percent_complete: 0.0,
            speed_bps: 0.0,
            eta_seconds: None,
        };
        progress.calculate_percentage();
        progress
    }

    /// Calculate percentage from bytes
    pub fn calculate_percentage(&mut self) {
        self.percent_complete = match self.expected_size {
            Some(total) if total > 0 => (self.bytes_written as f64 / total as f64) * 100.0,
            _ => 0.0,
        };
    }

    /// Calculate ETA from speed and remaining bytes
    pub fn calculate_eta(&mut self) {
        self.eta_seconds = match self.expected_size {
            Some(total) if self.speed_bps > 0.0 => {
                let remaining = total.saturating_sub(self.bytes_written);
                Some((remaining as f64 / self.speed_bps) as u64)
            }
            _ => None,
        };
    }

    /// Format download speed as human-readable string (e.g., "2.5 MB/s")
    pub fn speed_string(&self) -> String {
        format!("{:.1} MB/s", self.speed_bps / 1_000_000.0)
    }

    /// Format ETA as human-readable string (e.g., "5m 30s")
    pub fn eta_string(&self) -> String {
        let Some(eta) = self.eta_seconds else {
            return "calculating...".to_string();
        };

        let hours = eta / 3600;
        let minutes = (eta % 3600) / 60;
        let seconds = eta % 60;

        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Format bytes as human-readable string (e.g., "45.2 MB")
    pub fn bytes_string(bytes: u64) -> String {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    }

    /// One-line rendering for logs and the CLI
    pub fn display_string(&self) -> String {
        match self.expected_size {
            Some(total) => format!(
                "{}: {:.1}% ({} / {}) - {} - {}",
                self.name,
                self.percent_complete,
                Self::bytes_string(self.bytes_written),
                Self::bytes_string(total),
                self.speed_string(),
                self.eta_string()
            ),
            None => format!(
                "{}: {} - {}",
                self.name,
                Self::bytes_string(self.bytes_written),
                self.speed_string()
            ),
        }
    }
}

/// Speed tracker with moving average
///
/// Uses a sliding window to smooth out network fluctuations
#[derive(Debug)]
pub struct SpeedTracker {
    /// Samples within the time window
    samples: VecDeque<SpeedSample>,

    /// Time window for averaging (default 10 seconds)
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    /// Total bytes at this point in time
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    /// Add a position sample (total bytes written so far)
    pub fn add_position(&mut self, position: u64) {
        self.add_position_at(position, Instant::now());
    }

    fn add_position_at(&mut self, position: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        // Remove samples outside the window
        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}
