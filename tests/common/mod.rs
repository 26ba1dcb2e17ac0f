//! Shared fixtures for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{stream, StreamExt};
use offline_media_core::download::RemoteResponse;
use offline_media_core::{
    CoreError, DownloadEvent, DownloadStatus, ErrorRecord, ManagerConfig, RemoteSource, Result,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Semaphore};

pub const URL: &str = "https://media.example.com/lessons/a.mp4";
pub const CHUNK: usize = 100_000;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory remote source
///
/// With a gate, each body chunk waits for one permit, so a test can hold a
/// transfer at an exact chunk boundary.
pub struct MemorySource {
    resources: Mutex<HashMap<String, Bytes>>,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    opens: Mutex<Vec<(String, u64)>>,
    fail_next: Mutex<HashMap<String, u16>>,
    ignore_ranges: AtomicBool,
}

impl MemorySource {
    pub fn new(chunk_size: usize) -> Arc<Self> {
        Arc::new(Self::build(chunk_size, None))
    }

    /// Source whose chunks are released with [`release`](Self::release)
    pub fn gated(chunk_size: usize) -> Arc<Self> {
        Arc::new(Self::build(chunk_size, Some(Arc::new(Semaphore::new(0)))))
    }

    fn build(chunk_size: usize, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            chunk_size,
            gate,
            opens: Mutex::new(Vec::new()),
            fail_next: Mutex::new(HashMap::new()),
            ignore_ranges: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, url: &str, data: Vec<u8>) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), Bytes::from(data));
    }

    /// Let `chunks` more body chunks through
    pub fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    /// Answer the next open of `url` with an HTTP error status
    pub fn fail_next_open(&self, url: &str, status: u16) {
        self.fail_next.lock().unwrap().insert(url.to_string(), status);
    }

    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges.store(ignore, Ordering::SeqCst);
    }

    /// Every `(url, offset)` opened so far
    pub fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }
}

impl RemoteSource for MemorySource {
    fn open(&self, url: &str, offset: u64) -> BoxFuture<'static, Result<RemoteResponse>> {
        self.opens.lock().unwrap().push((url.to_string(), offset));

        if let Some(status) = self.fail_next.lock().unwrap().remove(url) {
            let error = CoreError::http_status(status, url);
            return Box::pin(async move { Err(error) });
        }

        let Some(data) = self.resources.lock().unwrap().get(url).cloned() else {
            let error = CoreError::http_status(404, url);
            return Box::pin(async move { Err(error) });
        };

        let resumed = offset > 0 && !self.ignore_ranges.load(Ordering::SeqCst);
        let start = if resumed { offset as usize } else { 0 };
        if start > data.len() {
            let error = CoreError::SizeMismatch {
                expected: offset,
                actual: data.len() as u64,
            };
            return Box::pin(async move { Err(error) });
        }

        let chunks: Vec<Result<Bytes>> = data[start..]
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        let gate = self.gate.clone();
        let body = stream::iter(chunks)
            .then(move |chunk| {
                let gate = gate.clone();
                async move {
                    if let Some(gate) = gate {
                        if let Ok(permit) = gate.acquire().await {
                            permit.forget();
                        }
                    }
                    chunk
                }
            })
            .boxed();

        let response = RemoteResponse {
            resumed,
            total_size: Some(data.len() as u64),
            body,
        };
        Box::pin(async move { Ok(response) })
    }
}

/// Deterministic test content
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Config with one flush per test chunk
pub fn config(dir: &Path) -> ManagerConfig {
    ManagerConfig {
        flush_threshold_bytes: CHUNK as u64,
        ..ManagerConfig::new(dir)
    }
}

/// Next event matching `matches`; panics after a timeout
pub async fn wait_for<F>(events: &mut broadcast::Receiver<DownloadEvent>, mut matches: F) -> DownloadEvent
where
    F: FnMut(&DownloadEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until `id` enters `status`; returns the attached error
pub async fn wait_for_status(
    events: &mut broadcast::Receiver<DownloadEvent>,
    id: &str,
    status: DownloadStatus,
) -> Option<ErrorRecord> {
    let event = wait_for(events, |event| {
        matches!(event, DownloadEvent::StatusChanged { id: changed, new, .. } if changed == id && *new == status)
    })
    .await;

    match event {
        DownloadEvent::StatusChanged { error, .. } => error,
        _ => None,
    }
}

/// Wait until progress for `id` reaches exactly `bytes`
pub async fn wait_for_progress(
    events: &mut broadcast::Receiver<DownloadEvent>,
    id: &str,
    bytes: u64,
) {
    wait_for(events, |event| {
        matches!(event, DownloadEvent::Progress(p) if p.id == id && p.bytes_written == bytes)
    })
    .await;
}
