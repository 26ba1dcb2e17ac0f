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


//! One resumable transfer from a remote source to a local file
//!
//! # Key Features
//! - Resume from a byte offset when the source honours ranges
//! - Buffered writing (8KB) with durable flushes every 1MB (a chunk boundary)
//! - Cooperative cancellation between chunks; the file is kept
//! - Whole-file SHA-256 once every expected byte is on disk
//!
//! # Resume Hygiene
//! 1. Clamp the offset to the current file length
//! 2. If the offset already equals the expected size, skip the network
//! 3. Ask the source for `offset..`; if it answers from byte zero, restart
//! 4. Truncate the file to the offset so unpersisted tail bytes are dropped
//!
//! A transfer never touches the manifest. Everything it learns is reported
//! as a [`TransferMessage`] on the manager's queue.

use crate::config::ManagerConfig;
use crate::download::remote::RemoteSource;
use crate::error::{CoreError, Result};
use crate::file::{sha256_file, FileManager};
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// What to fetch and where to put it
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub url: String,
    pub path: PathBuf,
    /// Last persisted `bytes_written`
    pub offset: u64,
    pub expected_size: Option<u64>,
}

/// Write tuning
#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub flush_threshold: u64,
    pub write_buffer: usize,
}

impl From<&ManagerConfig> for TransferSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            flush_threshold: config.flush_threshold_bytes,
            write_buffer: config.write_buffer_bytes,
        }
    }
}

/// Something a transfer observed
#[derive(Debug)]
pub enum TransferEvent {
    /// Source opened; bytes land from `resumed_from` onwards
    Started {
        resumed_from: u64,
        expected_size: Option<u64>,
    },
    /// Bytes durably on disk (a chunk boundary)
    Progress { bytes_written: u64 },
    /// Every byte written and hashed
    Completed {
        bytes_written: u64,
        expected_size: Option<u64>,
        checksum: String,
    },
    /// Stopped with an error; `bytes_written` is the last durable position
    Failed {
        bytes_written: u64,
        error: CoreError,
    },
    /// Stopped by cancel at a chunk boundary
    Cancelled { bytes_written: u64 },
}

impl TransferEvent {
    /// Last event of a transfer
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Failed { .. }
                | TransferEvent::Cancelled { .. }
        )
    }
}

/// Event tagged with the item id and the transfer that produced it
#[derive(Debug)]
pub struct TransferMessage {
    pub id: String,
    pub transfer: u64,
    pub event: TransferEvent,
}

/// Cancellable handle to a running transfer
#[derive(Debug)]
pub struct TransferHandle {
    pub id: String,
    pub transfer_id: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TransferHandle {
    /// Ask the transfer to stop at the next chunk boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the task to exit; aborts it after `grace`
    ///
    /// Returns `true` if the task stopped on its own.
    pub async fn wait(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(id = %self.id, transfer = self.transfer_id, "Transfer did not stop in time, aborting");
                self.join.abort();
                false
            }
        }
    }
}

/// One download of one item
pub struct Transfer {
    request: TransferRequest,
    source: Arc<dyn RemoteSource>,
    settings: TransferSettings,
}

impl Transfer {
    pub fn new(
        request: TransferRequest,
        source: Arc<dyn RemoteSource>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            request,
            source,
            settings,
        }
    }

    /// Spawn the transfer and return its handle immediately
    pub fn start(self, events: UnboundedSender<TransferMessage>) -> TransferHandle {
        let transfer_id = NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let id = self.request.id.clone();

        let reporter = Reporter {
            id: id.clone(),
            transfer: transfer_id,
            events,
        };
        let join = tokio::spawn(self.run(reporter, token.clone()));

        TransferHandle {
            id,
            transfer_id,
            token,
            join,
        }
    }

    async fn run(self, reporter: Reporter, token: CancellationToken) {
        let mut durable = self.request.offset;

        let event = match self.execute(&reporter, &token, &mut durable).await {
            Ok(event) => event,
            Err(error) => {
                warn!(id = %reporter.id, bytes_written = durable, error = %error, "Transfer failed");
                TransferEvent::Failed {
                    bytes_written: durable,
                    error,
                }
            }
        };

        reporter.send(event);
    }

    async fn execute(
        &self,
        reporter: &Reporter,
        token: &CancellationToken,
        durable: &mut u64,
    ) -> Result<TransferEvent> {
        let req = &self.request;

        let on_disk = FileManager::file_size(&req.path).await?.unwrap_or(0);
        let mut offset = req.offset.min(on_disk);
        if offset < req.offset {
            debug!(id = %req.id, persisted = req.offset, on_disk, "File shorter than record, resuming from file length");
        }
        *durable = offset;

        if offset > 0 && req.expected_size == Some(offset) {
            debug!(id = %req.id, offset, "All bytes already on disk, skipping network");
            let file = open_at(&req.path, offset).await?;
            file.sync_data().await.map_err(|e| CoreError::from_io(&req.path, e))?;
            reporter.send(TransferEvent::Started {
                resumed_from: offset,
                expected_size: req.expected_size,
            });
            return self.finish(offset, req.expected_size).await;
        }

        let response = tokio::select! {
            _ = token.cancelled() => {
                return Ok(TransferEvent::Cancelled { bytes_written: offset });
            }
            response = self.source.open(&req.url, offset) => response?,
        };

        let expected_size = if response.resumed {
            if let (Some(expected), Some(total)) = (req.expected_size, response.total_size) {
                if expected != total {
                    return Err(CoreError::SizeMismatch {
                        expected,
                        actual: total,
                    });
                }
            }
            response.total_size.or(req.expected_size)
        } else {
            if offset > 0 {
                warn!(id = %req.id, offset, "Source ignored resume offset, restarting from zero");
                offset = 0;
                *durable = 0;
            }
            response.total_size
        };

        if let Some(expected) = expected_size {
            if offset > expected {
                return Err(CoreError::SizeMismatch {
                    expected,
                    actual: offset,
                });
            }
        }

        let file = open_at(&req.path, offset).await?;
        let mut writer = BufWriter::with_capacity(self.settings.write_buffer, file);

        info!(id = %req.id, resumed_from = offset, expected_size, "Transfer started");
        reporter.send(TransferEvent::Started {
            resumed_from: offset,
            expected_size,
        });

        let mut body = response.body;
        let mut position = offset;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    sync_to_disk(&mut writer, &req.path).await?;
                    *durable = position;
                    info!(id = %req.id, bytes_written = position, "Transfer cancelled");
                    return Ok(TransferEvent::Cancelled { bytes_written: position });
                }
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    // Keep whatever already arrived
                    if sync_to_disk(&mut writer, &req.path).await.is_ok() {
                        *durable = position;
                    }
                    return Err(e);
                }
                None => break,
            };

            let chunk_len = chunk.len() as u64;
            if let Some(expected) = expected_size {
                if position + chunk_len > expected {
                    return Err(CoreError::SizeMismatch {
                        expected,
                        actual: position + chunk_len,
                    });
                }
            }

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| CoreError::from_io(&req.path, e))?;
            position += chunk_len;

            if position - *durable >= self.settings.flush_threshold {
                sync_to_disk(&mut writer, &req.path).await?;
                *durable = position;
                reporter.send(TransferEvent::Progress {
                    bytes_written: position,
                });
            }
        }

        sync_to_disk(&mut writer, &req.path).await?;
        if position > *durable {
            *durable = position;
            reporter.send(TransferEvent::Progress {
                bytes_written: position,
            });
        }

        if let Some(expected) = expected_size {
            if position < expected {
                return Err(CoreError::network_error(
                    format!("Stream ended early: {}/{} bytes", position, expected),
                    true,
                ));
            }
        }

        self.finish(position, expected_size).await
    }

    async fn finish(&self, bytes_written: u64, expected_size: Option<u64>) -> Result<TransferEvent> {
        let checksum = sha256_file(&self.request.path).await?;
        info!(id = %self.request.id, bytes_written, checksum = %checksum, "Transfer completed");

        Ok(TransferEvent::Completed {
            bytes_written,
            expected_size,
            checksum,
        })
    }
}

struct Reporter {
    id: String,
    transfer: u64,
    events: UnboundedSender<TransferMessage>,
}

impl Reporter {
    fn send(&self, event: TransferEvent) {
        // Manager gone means nobody is listening anymore
        let _ = self.events.send(TransferMessage {
            id: self.id.clone(),
            transfer: self.transfer,
            event,
        });
    }
}

/// Open for writing, cut to `offset` and position the cursor there
async fn open_at(path: &Path, offset: u64) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::from_io(parent, e))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| CoreError::from_io(path, e))?;

    file.set_len(offset)
        .await
        .map_err(|e| CoreError::from_io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| CoreError::from_io(path, e))?;

    Ok(file)
}

async fn sync_to_disk(writer: &mut BufWriter<File>, path: &Path) -> Result<()> {
    writer.flush().await.map_err(|e| CoreError::from_io(path, e))?;
    writer
        .get_ref()
        .sync_data()
        .await
        .map_err(|e| CoreError::from_io(path, e))
}
