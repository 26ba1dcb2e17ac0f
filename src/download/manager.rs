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


//! Download manager: lifecycle of every known item
//!
//! # State Machine (per id)
//! ```text
//! Pending -> InProgress -> Complete | Failed | Paused
//! Paused  -> InProgress   (resume)
//! Failed  -> InProgress   (operator retry only)
//! ```
//!
//! # Concurrency
//! One control task owns the item map and the [`ManifestStore`]. Public
//! methods send commands to it; transfers report back on a queue it drains.
//! Every manifest write therefore happens on that one task, and at most one
//! transfer is bound to an id at a time. Transfers for different ids run in
//! parallel with their own files.
//!
//! # Persistence
//! - Status changes are saved before they are announced
//! - Progress is saved at most once per `persist_interval_ms` per item
//! - Teardown saves anything still pending
//!
//! After a crash an item resumes from its last persisted `bytes_written`.

use crate::config::{CorruptManifestPolicy, ManagerConfig};
use crate::download::item::{DownloadItem, DownloadStatus, RequestOptions};
use crate::download::manifest::ManifestStore;
use crate::download::progress::{DownloadProgress, SpeedTracker};
use crate::download::remote::{HttpSource, RemoteSource};
use crate::download::transfer::{
    Transfer, TransferEvent, TransferHandle, TransferMessage, TransferRequest, TransferSettings,
};
use crate::error::{CoreError, ErrorRecord, Result};
use crate::file::checksum::{checksums_match, sha256_file};
use crate::file::{local_path_for, FileManager};
use crate::playback::PlaybackHandle;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

const COMMAND_CAPACITY: usize = 64;

/// Notification for UI and other observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    StatusChanged {
        id: String,
        /// `None` when the item was just created
        old: Option<DownloadStatus>,
        new: DownloadStatus,
        error: Option<ErrorRecord>,
    },
    Removed {
        id: String,
    },
}

/// Whether the manifest was loaded intact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ManifestHealth {
    Healthy,
    /// Started empty after an unreadable manifest was moved aside
    Degraded { reason: String },
}

impl ManifestHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ManifestHealth::Degraded { .. })
    }
}

/// Outcome of a delete
///
/// The manifest record is always gone when this is returned; a file that
/// could not be removed is reported in `file_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub id: String,
    pub file_removed: bool,
    pub file_error: Option<String>,
}

enum Command {
    Request {
        id: String,
        url: String,
        options: RequestOptions,
        reply: oneshot::Sender<Result<DownloadItem>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<DeleteReport>>,
    },
    List {
        reply: oneshot::Sender<Vec<DownloadItem>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<DownloadItem>>,
    },
    Health {
        reply: oneshot::Sender<ManifestHealth>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Work finished off the control task
enum Internal {
    Verified {
        id: String,
        transfer: u64,
        result: Result<String>,
    },
    DeleteFinished {
        id: String,
    },
}

/// Handle to the download manager
///
/// Cheap to clone. The manager stops (with a full teardown) when
/// [`shutdown`](Self::shutdown) is called or the last handle is dropped.
#[derive(Clone)]
pub struct DownloadManager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<DownloadEvent>,
    verify_before_playback: bool,
}

impl DownloadManager {
    /// Load the manifest and start the manager with the HTTP source
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        let source = Arc::new(HttpSource::new(&config)?);
        Self::with_source(config, source).await
    }

    /// Load the manifest and start the manager with a custom source
    pub async fn with_source(config: ManagerConfig, source: Arc<dyn RemoteSource>) -> Result<Self> {
        config.validate()?;

        let files = FileManager::new(config.download_dir.clone());
        files.ensure_directory_exists(&config.download_dir).await?;

        let store = ManifestStore::new(config.manifest_path());
        let (items, health) = match store.load().await {
            Ok(items) => (items, ManifestHealth::Healthy),
            Err(e @ CoreError::CorruptManifest { .. }) => match config.on_corrupt_manifest {
                CorruptManifestPolicy::Abort => {
                    error!(error = %e, "Manifest unreadable, refusing to start");
                    return Err(e);
                }
                CorruptManifestPolicy::Reset => {
                    let moved = store.quarantine().await?;
                    store.reset().await?;
                    warn!(error = %e, moved_to = %moved.display(), "Manifest unreadable, starting empty");
                    let reason = format!("{} (moved to {})", e, moved.display());
                    (Default::default(), ManifestHealth::Degraded { reason })
                }
            },
            Err(e) => return Err(e),
        };

        let mut items: HashMap<String, DownloadItem> = items.into_iter().collect();

        // No transfer survives a restart
        for item in items.values_mut() {
            if item.status == DownloadStatus::InProgress {
                info!(id = %item.id, bytes_written = item.bytes_written, "Recovering interrupted download as paused");
                item.status = DownloadStatus::Paused;
                item.touch();
                store.save(item).await?;
            }
        }

        info!(
            dir = %config.download_dir.display(),
            items = items.len(),
            degraded = health.is_degraded(),
            "Download manager started"
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let verify_before_playback = config.verify_before_playback;
        let control = ControlLoop {
            config,
            source,
            store,
            files,
            items,
            active: HashMap::new(),
            waiters: HashMap::new(),
            deleting: HashSet::new(),
            cleanups: Vec::new(),
            dirty: HashSet::new(),
            last_persist: HashMap::new(),
            speed: HashMap::new(),
            health,
            shutting_down: false,
            events: event_tx.clone(),
            transfer_tx,
            internal_tx,
        };
        tokio::spawn(control.run(command_rx, transfer_rx, internal_rx));

        Ok(Self {
            commands: command_tx,
            events: event_tx,
            verify_before_playback,
        })
    }

    /// Start or resume the download of `id` from `url`
    pub async fn request(&self, id: &str, url: &str) -> Result<DownloadItem> {
        self.request_with(id, url, RequestOptions::default()).await
    }

    pub async fn request_with(
        &self,
        id: &str,
        url: &str,
        options: RequestOptions,
    ) -> Result<DownloadItem> {
        self.call(|reply| Command::Request {
            id: id.to_string(),
            url: url.to_string(),
            options,
            reply,
        })
        .await?
    }

    /// Stop the active transfer for `id`; returns once the item has left `InProgress`
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.call(|reply| Command::Cancel {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Cancel any transfer, remove the record and the backing file
    pub async fn delete(&self, id: &str) -> Result<DeleteReport> {
        self.call(|reply| Command::Delete {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Snapshot of every item, most recently updated first
    pub async fn list(&self) -> Result<Vec<DownloadItem>> {
        self.call(|reply| Command::List { reply }).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DownloadItem>> {
        self.call(|reply| Command::Get {
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn health(&self) -> Result<ManifestHealth> {
        self.call(|reply| Command::Health { reply }).await
    }

    /// Validated handle for a `Complete` item
    pub async fn playback(&self, id: &str) -> Result<PlaybackHandle> {
        let item = self
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        PlaybackHandle::prepare(&item, self.verify_before_playback).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Cancel transfers, persist pending state and stop the control task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            // Already stopped
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| CoreError::internal("Download manager has shut down"))?;
        rx.await
            .map_err(|_| CoreError::internal("Download manager stopped before replying"))
    }
}

/// Checks applied when a transfer reports completion
#[derive(Debug, Clone)]
pub(crate) struct CompletionCheck {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub expected_size: Option<u64>,
    pub reported: String,
    pub expected_checksum: Option<String>,
}

impl CompletionCheck {
    /// Returns the verified checksum
    pub(crate) async fn verify(&self) -> Result<String> {
        if let Some(expected) = self.expected_size {
            if self.bytes_written != expected {
                return Err(CoreError::SizeMismatch {
                    expected,
                    actual: self.bytes_written,
                });
            }
        }

        let on_disk = FileManager::file_size(&self.path).await?.unwrap_or(0);
        if on_disk != self.bytes_written {
            return Err(CoreError::SizeMismatch {
                expected: self.bytes_written,
                actual: on_disk,
            });
        }

        let actual = sha256_file(&self.path).await?;
        if !checksums_match(&actual, &self.reported) {
            return Err(CoreError::Integrity {
                expected: self.reported.clone(),
                actual,
                path: self.path.clone(),
            });
        }

        if let Some(expected) = &self.expected_checksum {
            if !checksums_match(&actual, expected) {
                return Err(CoreError::Integrity {
                    expected: expected.clone(),
                    actual,
                    path: self.path.clone(),
                });
            }
        }

        Ok(actual)
    }
}

fn validate_request(id: &str, url: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CoreError::invalid_input("Download id must not be empty"));
    }

    let parsed = Url::parse(url)
        .map_err(|e| CoreError::invalid_input(format!("Invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(CoreError::invalid_input(format!(
            "Unsupported URL scheme '{}'",
            scheme
        ))),
    }
}

fn merge_options(item: &mut DownloadItem, options: RequestOptions) {
    if options.display_name.is_some() {
        item.display_name = options.display_name;
    }
    if options.expected_checksum.is_some() {
        item.expected_checksum = options.expected_checksum;
    }
}

struct ControlLoop {
    config: ManagerConfig,
    source: Arc<dyn RemoteSource>,
    store: ManifestStore,
    files: FileManager,
    items: HashMap<String, DownloadItem>,
    /// Live transfer per id
    active: HashMap<String, TransferHandle>,
    /// Cancel callers waiting for the item to leave InProgress
    waiters: HashMap<String, Vec<oneshot::Sender<Result<()>>>>,
    /// Ids whose file cleanup is still running
    deleting: HashSet<String>,
    cleanups: Vec<JoinHandle<()>>,
    /// Ids with progress not yet saved
    dirty: HashSet<String>,
    last_persist: HashMap<String, Instant>,
    speed: HashMap<String, SpeedTracker>,
    health: ManifestHealth,
    shutting_down: bool,
    events: broadcast::Sender<DownloadEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferMessage>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transfers: mpsc::UnboundedReceiver<TransferMessage>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut ticker = tokio::time::interval(self.config.persist_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown(&mut transfers, &mut internal).await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        // Every handle dropped
                        self.teardown(&mut transfers, &mut internal).await;
                        return;
                    }
                },
                Some(message) = transfers.recv() => self.on_transfer(message).await,
                Some(message) = internal.recv() => self.on_internal(message).await,
                _ = ticker.tick() => self.flush_dirty(false).await,
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Request {
                id,
                url,
                options,
                reply,
            } => {
                let result = self.request(id, url, options).await;
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => self.cancel(id, reply),
            Command::Delete { id, reply } => self.delete(id, reply).await,
            Command::List { reply } => {
                let mut items: Vec<DownloadItem> = self.items.values().cloned().collect();
                items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
                let _ = reply.send(items);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.items.get(&id).cloned());
            }
            Command::Health { reply } => {
                let _ = reply.send(self.health.clone());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn request(
        &mut self,
        id: String,
        url: String,
        options: RequestOptions,
    ) -> Result<DownloadItem> {
        validate_request(&id, &url)?;

        if self.deleting.contains(&id) {
            return Err(CoreError::InvalidState(format!(
                "Download {} is being deleted",
                id
            )));
        }

        let item = match self.items.get(&id).cloned() {
            None => {
                let path = local_path_for(&self.config.download_dir, &id);
                if path == self.store.path() {
                    return Err(CoreError::invalid_input(format!(
                        "Download id '{}' collides with the manifest file",
                        id
                    )));
                }

                let item = DownloadItem::new(id.clone(), url, path, options);
                self.save(&item).await?;
                self.items.insert(id.clone(), item.clone());
                info!(id = %id, url = %item.source_url, "Download created");
                self.emit(DownloadEvent::StatusChanged {
                    id,
                    old: None,
                    new: DownloadStatus::Pending,
                    error: None,
                });
                item
            }
            Some(mut item) => {
                if item.source_url != url {
                    return Err(CoreError::invalid_input(format!(
                        "Download {} already exists with a different URL",
                        id
                    )));
                }

                match item.status {
                    DownloadStatus::InProgress => {
                        debug!(id = %id, "Already in progress");
                        return Ok(item);
                    }
                    DownloadStatus::Complete => {
                        if FileManager::file_exists(&item.local_path).await {
                            debug!(id = %id, "Already complete");
                            return Ok(item);
                        }
                        warn!(id = %id, path = %item.local_path.display(), "Completed file is gone, downloading again");
                        item.reset_progress();
                    }
                    _ => {
                        if item.needs_restart() {
                            info!(id = %id, "Previous failure requires a restart from zero");
                            item.reset_progress();
                        }
                    }
                }

                merge_options(&mut item, options);
                item
            }
        };

        self.start_transfer(item).await
    }

    async fn start_transfer(&mut self, mut item: DownloadItem) -> Result<DownloadItem> {
        let old = item.status;
        item.status = DownloadStatus::InProgress;
        item.last_error = None;
        item.touch();

        // Durable before any progress can arrive
        self.save(&item).await?;
        self.items.insert(item.id.clone(), item.clone());
        self.emit(DownloadEvent::StatusChanged {
            id: item.id.clone(),
            old: Some(old),
            new: DownloadStatus::InProgress,
            error: None,
        });

        let request = TransferRequest {
            id: item.id.clone(),
            url: item.source_url.clone(),
            path: item.local_path.clone(),
            offset: item.bytes_written,
            expected_size: item.expected_size,
        };
        let handle = Transfer::new(
            request,
            self.source.clone(),
            TransferSettings::from(&self.config),
        )
        .start(self.transfer_tx.clone());

        info!(id = %item.id, offset = item.bytes_written, transfer = handle.transfer_id, "Transfer requested");
        self.speed.insert(item.id.clone(), SpeedTracker::new());
        self.active.insert(item.id.clone(), handle);

        Ok(item)
    }

    fn cancel(&mut self, id: String, reply: oneshot::Sender<Result<()>>) {
        if !self.items.contains_key(&id) {
            let _ = reply.send(Err(CoreError::NotFound(id)));
            return;
        }

        match self.active.get(&id) {
            Some(handle) => {
                if !handle.is_cancelled() {
                    info!(id = %id, transfer = handle.transfer_id, "Cancelling transfer");
                    handle.cancel();
                }
                self.waiters.entry(id).or_default().push(reply);
            }
            None => {
                debug!(id = %id, "Nothing to cancel");
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn delete(&mut self, id: String, reply: oneshot::Sender<Result<DeleteReport>>) {
        let Some(path) = self.items.get(&id).map(|item| item.local_path.clone()) else {
            let _ = reply.send(Err(CoreError::NotFound(id)));
            return;
        };

        // Writer stops before the record goes
        if let Some(handle) = self.active.get(&id) {
            handle.cancel();
        }

        if let Err(e) = self.store.delete(&id).await {
            error!(id = %id, error = %e, "Failed to remove manifest record");
            let _ = reply.send(Err(e));
            return;
        }

        self.items.remove(&id);
        self.dirty.remove(&id);
        self.last_persist.remove(&id);
        self.speed.remove(&id);

        let handle = self.active.remove(&id);
        self.release_waiters(&id);

        self.deleting.insert(id.clone());
        info!(id = %id, "Download deleted");
        self.emit(DownloadEvent::Removed { id: id.clone() });

        let files = self.files.clone();
        let grace = self.config.cancel_grace();
        let internal = self.internal_tx.clone();

        self.cleanups.push(tokio::spawn(async move {
            // The writer must be gone before the file is
            if let Some(mut handle) = handle {
                handle.wait(grace).await;
            }

            let report = match files.safe_delete(&path).await {
                Ok(file_removed) => DeleteReport {
                    id: id.clone(),
                    file_removed,
                    file_error: None,
                },
                Err(e) => {
                    warn!(id = %id, error = %e, "Backing file could not be removed");
                    DeleteReport {
                        id: id.clone(),
                        file_removed: false,
                        file_error: Some(e.to_string()),
                    }
                }
            };

            let _ = internal.send(Internal::DeleteFinished { id });
            let _ = reply.send(Ok(report));
        }));
    }

    async fn on_transfer(&mut self, message: TransferMessage) {
        let TransferMessage {
            id,
            transfer,
            event,
        } = message;

        if self.active.get(&id).map(|h| h.transfer_id) != Some(transfer) {
            debug!(id = %id, transfer, "Ignoring event from stale transfer");
            return;
        }

        match event {
            TransferEvent::Started {
                resumed_from,
                expected_size,
            } => {
                if let Some(item) = self.items.get_mut(&id) {
                    item.bytes_written = resumed_from;
                    item.expected_size = expected_size;
                    item.touch();
                }
                self.persist(&id).await;
                self.emit_progress(&id);
            }
            TransferEvent::Progress { bytes_written } => {
                if let Some(item) = self.items.get_mut(&id) {
                    item.bytes_written = bytes_written;
                    item.touch();
                }
                self.persist_throttled(&id).await;
                self.emit_progress(&id);
            }
            TransferEvent::Completed {
                bytes_written,
                expected_size,
                checksum,
            } => {
                let Some(item) = self.items.get_mut(&id) else {
                    return;
                };
                item.bytes_written = bytes_written;
                if expected_size.is_some() {
                    item.expected_size = expected_size;
                }
                item.touch();

                let check = CompletionCheck {
                    path: item.local_path.clone(),
                    bytes_written,
                    expected_size: item.expected_size,
                    reported: checksum,
                    expected_checksum: item.expected_checksum.clone(),
                };

                if self.shutting_down {
                    let result = check.verify().await;
                    self.apply_verification(&id, result).await;
                } else {
                    let internal = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let result = check.verify().await;
                        let _ = internal.send(Internal::Verified {
                            id,
                            transfer,
                            result,
                        });
                    });
                }
            }
            TransferEvent::Failed {
                bytes_written,
                error,
            } => {
                if let Some(item) = self.items.get_mut(&id) {
                    item.bytes_written = bytes_written;
                }
                self.finish(&id, DownloadStatus::Failed, Some(ErrorRecord::from_error(&error)))
                    .await;
            }
            TransferEvent::Cancelled { bytes_written } => {
                if let Some(item) = self.items.get_mut(&id) {
                    item.bytes_written = bytes_written;
                }
                self.finish(&id, DownloadStatus::Paused, None).await;
            }
        }
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Verified {
                id,
                transfer,
                result,
            } => {
                if self.active.get(&id).map(|h| h.transfer_id) != Some(transfer) {
                    debug!(id = %id, transfer, "Ignoring verification of stale transfer");
                    return;
                }
                self.apply_verification(&id, result).await;
            }
            Internal::DeleteFinished { id } => {
                self.deleting.remove(&id);
                self.cleanups.retain(|cleanup| !cleanup.is_finished());
            }
        }
    }

    async fn apply_verification(&mut self, id: &str, result: Result<String>) {
        match result {
            Ok(checksum) => {
                if let Some(item) = self.items.get_mut(id) {
                    item.checksum = Some(checksum);
                    if item.expected_size.is_none() {
                        item.expected_size = Some(item.bytes_written);
                    }
                }
                self.finish(id, DownloadStatus::Complete, None).await;
            }
            Err(e) => {
                // File stays on disk for diagnostics
                warn!(id = %id, error = %e, "Completion check failed");
                self.finish(id, DownloadStatus::Failed, Some(ErrorRecord::from_error(&e)))
                    .await;
            }
        }
    }

    /// Unbind the transfer and move the item to its final status
    async fn finish(&mut self, id: &str, status: DownloadStatus, error: Option<ErrorRecord>) {
        self.active.remove(id);
        self.speed.remove(id);
        self.transition(id, status, error).await;
        self.release_waiters(id);
    }

    async fn transition(&mut self, id: &str, new: DownloadStatus, error: Option<ErrorRecord>) {
        let Some(item) = self.items.get_mut(id) else {
            return;
        };

        let old = item.status;
        item.status = new;
        item.last_error = error.clone();
        item.touch();

        match &error {
            Some(record) => warn!(id = %id, from = %old, to = %new, error = %record.message, "Status changed"),
            None => info!(id = %id, from = %old, to = %new, bytes_written = item.bytes_written, "Status changed"),
        }

        self.persist(id).await;
        self.emit(DownloadEvent::StatusChanged {
            id: id.to_string(),
            old: Some(old),
            new,
            error,
        });
    }

    fn release_waiters(&mut self, id: &str) {
        if let Some(waiters) = self.waiters.remove(id) {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    async fn save(&mut self, item: &DownloadItem) -> Result<()> {
        match self.store.save(item).await {
            Ok(()) => {
                self.dirty.remove(&item.id);
                self.last_persist.insert(item.id.clone(), Instant::now());
                Ok(())
            }
            Err(e) => {
                self.dirty.insert(item.id.clone());
                Err(e)
            }
        }
    }

    /// Save now; failures are logged and retried on the next tick
    async fn persist(&mut self, id: &str) {
        let Some(item) = self.items.get(id).cloned() else {
            return;
        };
        if let Err(e) = self.save(&item).await {
            error!(id = %id, error = %e, "Failed to persist download");
        }
    }

    async fn persist_throttled(&mut self, id: &str) {
        let interval = self.config.persist_interval();
        let due = self
            .last_persist
            .get(id)
            .map_or(true, |at| at.elapsed() >= interval);

        if due {
            self.persist(id).await;
        } else {
            self.dirty.insert(id.to_string());
        }
    }

    async fn flush_dirty(&mut self, force: bool) {
        if self.dirty.is_empty() {
            return;
        }

        let interval = self.config.persist_interval();
        let due: Vec<String> = self
            .dirty
            .iter()
            .filter(|id| {
                force
                    || self
                        .last_persist
                        .get(*id)
                        .map_or(true, |at| at.elapsed() >= interval)
            })
            .cloned()
            .collect();

        for id in due {
            if self.items.contains_key(&id) {
                self.persist(&id).await;
            } else {
                self.dirty.remove(&id);
            }
        }
    }

    fn emit_progress(&mut self, id: &str) {
        let Some(item) = self.items.get(id) else {
            return;
        };

        let tracker = self.speed.entry(id.to_string()).or_default();
        tracker.add_position(item.bytes_written);

        let mut progress = DownloadProgress::new(
            item.id.clone(),
            item.name().to_string(),
            item.bytes_written,
            item.expected_size,
        );
        progress.speed_bps = tracker.average_speed();
        progress.calculate_eta();

        let _ = self.events.send(DownloadEvent::Progress(progress));
    }

    fn emit(&self, event: DownloadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn teardown(
        &mut self,
        transfers: &mut mpsc::UnboundedReceiver<TransferMessage>,
        internal: &mut mpsc::UnboundedReceiver<Internal>,
    ) {
        self.shutting_down = true;
        info!(active = self.active.len(), "Shutting down download manager");

        for handle in self.active.values() {
            handle.cancel();
        }
        let grace = self.config.cancel_grace();
        for handle in self.active.values_mut() {
            handle.wait(grace).await;
        }

        // Apply whatever the transfers managed to report
        while let Ok(message) = internal.try_recv() {
            self.on_internal(message).await;
        }
        while let Ok(message) = transfers.try_recv() {
            self.on_transfer(message).await;
        }

        // Aborted, or still verifying; resumable next start
        let stranded: Vec<String> = self.active.keys().cloned().collect();
        for id in stranded {
            self.finish(&id, DownloadStatus::Paused, None).await;
        }

        for cleanup in self.cleanups.iter_mut() {
            if tokio::time::timeout(grace, cleanup).await.is_err() {
                warn!("Delete cleanup did not finish before shutdown");
            }
        }

        self.flush_dirty(true).await;

        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        }

        info!("Download manager stopped");
    }
}
