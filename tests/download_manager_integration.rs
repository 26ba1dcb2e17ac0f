//! Integration tests for DownloadManager
//!
//! Drives the manager end to end against an in-memory source and a real
//! download directory: lifecycle, resume, cancel, delete, integrity and
//! recovery from crashes and corrupt manifests.

mod common;

use common::{
    config, payload, sha256_hex, wait_for, wait_for_progress, wait_for_status, MemorySource,
    CHUNK, URL,
};
use offline_media_core::download::ManifestStore;
use offline_media_core::file::local_path_for;
use offline_media_core::{
    CoreError, CorruptManifestPolicy, DownloadEvent, DownloadItem, DownloadManager,
    DownloadStatus, ErrorKind, ManifestHealth, RequestOptions,
};
use std::time::Duration;
use tempfile::TempDir;

const TOTAL: usize = 2_000_000;

async fn manager_with(dir: &TempDir, source: std::sync::Arc<MemorySource>) -> DownloadManager {
    DownloadManager::with_source(config(dir.path()), source)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fresh_request_completes() {
    let dir = TempDir::new().unwrap();
    let data = payload(TOTAL);
    let source = MemorySource::new(CHUNK);
    source.insert(URL, data.clone());

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    let item = manager.request("v1", URL).await.unwrap();
    assert_eq!(item.status, DownloadStatus::InProgress);

    let mut transitions = Vec::new();
    wait_for(&mut events, |event| match event {
        DownloadEvent::StatusChanged { id, old, new, .. } if id == "v1" => {
            transitions.push((*old, *new));
            *new == DownloadStatus::Complete
        }
        _ => false,
    })
    .await;

    assert_eq!(
        transitions,
        vec![
            (None, DownloadStatus::Pending),
            (Some(DownloadStatus::Pending), DownloadStatus::InProgress),
            (Some(DownloadStatus::InProgress), DownloadStatus::Complete),
        ]
    );

    let items = manager.list().await.unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.bytes_written, TOTAL as u64);
    assert_eq!(item.expected_size, Some(TOTAL as u64));
    assert_eq!(item.checksum.as_deref(), Some(sha256_hex(&data).as_str()));
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_pauses_and_request_resumes() {
    let dir = TempDir::new().unwrap();
    let data = payload(TOTAL);
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, data.clone());

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    source.release(5);
    wait_for_progress(&mut events, "v1", 500_000).await;

    manager.cancel("v1").await.unwrap();

    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(item.status, DownloadStatus::Paused);
    assert_eq!(item.bytes_written, 500_000);
    assert!(item.last_error.is_none());
    assert_eq!(std::fs::metadata(&item.local_path).unwrap().len(), 500_000);

    // The pause itself is durable
    let persisted = ManifestStore::new(dir.path().join("manifest.json"))
        .load()
        .await
        .unwrap();
    assert_eq!(persisted["v1"].status, DownloadStatus::Paused);
    assert_eq!(persisted["v1"].bytes_written, 500_000);

    manager.request("v1", URL).await.unwrap();
    assert_eq!(source.opens().last(), Some(&(URL.to_string(), 500_000)));

    let mut lowest = u64::MAX;
    source.release(1000);
    wait_for(&mut events, |event| match event {
        DownloadEvent::Progress(p) if p.id == "v1" => {
            lowest = lowest.min(p.bytes_written);
            false
        }
        DownloadEvent::StatusChanged { id, new, .. } => {
            id == "v1" && *new == DownloadStatus::Complete
        }
        _ => false,
    })
    .await;

    assert!(lowest >= 500_000);
    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_cancel_and_request_never_loses_progress() {
    let dir = TempDir::new().unwrap();
    let data = payload(1_000_000);
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, data.clone());

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    let mut observed = Vec::new();
    let mut expected = 0;
    for _ in 0..3 {
        manager.request("v1", URL).await.unwrap();
        source.release(3);
        expected += 3 * CHUNK as u64;
        wait_for_progress(&mut events, "v1", expected).await;

        manager.cancel("v1").await.unwrap();
        let item = manager.get("v1").await.unwrap().unwrap();
        assert_eq!(item.status, DownloadStatus::Paused);
        observed.push(item.bytes_written);
    }

    assert_eq!(observed, vec![300_000, 600_000, 900_000]);

    manager.request("v1", URL).await.unwrap();
    source.release(1);
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(item.bytes_written, 1_000_000);
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_while_in_progress() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, payload(TOTAL));

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    source.release(2);
    wait_for_progress(&mut events, "v1", 200_000).await;

    let path = manager.get("v1").await.unwrap().unwrap().local_path;
    assert!(path.exists());

    let report = manager.delete("v1").await.unwrap();
    assert_eq!(report.id, "v1");
    assert!(report.file_removed);
    assert!(report.file_error.is_none());

    // The cancelled transfer never surfaces as a pause
    let mut paused = false;
    wait_for(&mut events, |event| match event {
        DownloadEvent::StatusChanged { id, new, .. } if id == "v1" => {
            paused |= *new == DownloadStatus::Paused;
            false
        }
        DownloadEvent::Removed { id } => id == "v1",
        _ => false,
    })
    .await;
    assert!(!paused);

    // No second transfer was started
    assert_eq!(source.open_count(), 1);
    assert!(!path.exists());
    assert!(manager.list().await.unwrap().is_empty());
    assert!(manager.get("v1").await.unwrap().is_none());

    let persisted = ManifestStore::new(dir.path().join("manifest.json"))
        .load()
        .await
        .unwrap();
    assert!(persisted.is_empty());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_reports_file_error_but_removes_record() {
    let dir = TempDir::new().unwrap();

    // A non-empty directory where the backing file should be cannot be unlinked
    let path = local_path_for(dir.path(), "v1");
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("pinned"), b"x").unwrap();

    let mut item = DownloadItem::new(
        "v1".to_string(),
        URL.to_string(),
        path.clone(),
        RequestOptions::default(),
    );
    item.status = DownloadStatus::Paused;
    item.bytes_written = 100_000;
    ManifestStore::new(dir.path().join("manifest.json"))
        .save(&item)
        .await
        .unwrap();

    let manager = manager_with(&dir, MemorySource::new(CHUNK)).await;
    let report = manager.delete("v1").await.unwrap();

    assert!(!report.file_removed);
    assert!(report.file_error.is_some());
    assert!(path.exists());
    assert!(manager.list().await.unwrap().is_empty());

    let persisted = ManifestStore::new(dir.path().join("manifest.json"))
        .load()
        .await
        .unwrap();
    assert!(!persisted.contains_key("v1"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_progress_persistence_is_throttled_until_teardown() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, payload(TOTAL));

    let config = offline_media_core::ManagerConfig {
        persist_interval_ms: 60_000,
        ..config(dir.path())
    };
    let manager = DownloadManager::with_source(config, source.clone())
        .await
        .unwrap();
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    source.release(5);
    wait_for_progress(&mut events, "v1", 500_000).await;

    let in_memory = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(in_memory.bytes_written, 500_000);

    // On disk still holds the value saved when the transfer started
    let persisted = ManifestStore::new(dir.path().join("manifest.json"))
        .load()
        .await
        .unwrap();
    assert_eq!(persisted["v1"].status, DownloadStatus::InProgress);
    assert_eq!(persisted["v1"].bytes_written, 0);

    manager.shutdown().await.unwrap();

    let persisted = ManifestStore::new(dir.path().join("manifest.json"))
        .load()
        .await
        .unwrap();
    assert_eq!(persisted["v1"].status, DownloadStatus::Paused);
    assert_eq!(persisted["v1"].bytes_written, 500_000);
}

#[tokio::test]
async fn test_delete_unknown_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, MemorySource::new(CHUNK)).await;

    let result = manager.delete("missing").await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_manifest_resets_to_degraded_empty_state() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("manifest.json"), b"\x00\x01 not a manifest").unwrap();

    let source = MemorySource::new(CHUNK);
    source.insert(URL, payload(300_000));
    let manager = manager_with(&dir, source).await;

    assert!(matches!(
        manager.health().await.unwrap(),
        ManifestHealth::Degraded { .. }
    ));
    assert!(manager.list().await.unwrap().is_empty());

    let quarantined: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("manifest.json.corrupt-")
        })
        .collect();
    assert_eq!(quarantined.len(), 1);

    // Still fully usable
    let mut events = manager.subscribe();
    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_manifest_abort_policy_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("manifest.json"), b"{ truncated").unwrap();

    let config = offline_media_core::ManagerConfig {
        on_corrupt_manifest: CorruptManifestPolicy::Abort,
        ..config(dir.path())
    };
    let result = DownloadManager::with_source(config, MemorySource::new(CHUNK)).await;

    assert!(matches!(result, Err(CoreError::CorruptManifest { .. })));
    assert!(dir.path().join("manifest.json").exists());
}

#[tokio::test]
async fn test_integrity_failure_keeps_file_and_retry_restarts() {
    let dir = TempDir::new().unwrap();
    let data = payload(500_000);
    let source = MemorySource::new(CHUNK);
    source.insert(URL, data.clone());

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    let wrong = RequestOptions {
        expected_checksum: Some("00".repeat(32)),
        ..Default::default()
    };
    manager.request_with("v1", URL, wrong).await.unwrap();
    let error = wait_for_status(&mut events, "v1", DownloadStatus::Failed)
        .await
        .unwrap();
    assert_eq!(error.kind, ErrorKind::Integrity);
    assert!(!error.retryable);

    let item = manager.get("v1").await.unwrap().unwrap();
    assert!(item.checksum.is_none());
    assert_eq!(item.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Integrity));
    // Retained for diagnostics
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    let right = RequestOptions {
        expected_checksum: Some(sha256_hex(&data)),
        ..Default::default()
    };
    manager.request_with("v1", URL, right).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    assert_eq!(source.opens(), vec![(URL.to_string(), 0), (URL.to_string(), 0)]);
    let item = manager.get("v1").await.unwrap().unwrap();
    assert!(item.last_error.is_none());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_network_failure_is_not_retried_automatically() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new(CHUNK);
    source.insert(URL, payload(300_000));
    source.fail_next_open(URL, 503);

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    let error = wait_for_status(&mut events, "v1", DownloadStatus::Failed)
        .await
        .unwrap();
    assert_eq!(error.kind, ErrorKind::Network);
    assert!(error.retryable);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(source.open_count(), 1);

    // Operator retry
    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;
    assert_eq!(source.open_count(), 2);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, payload(300_000));

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    let again = manager.request("v1", URL).await.unwrap();
    assert_eq!(again.status, DownloadStatus::InProgress);
    assert_eq!(source.open_count(), 1);

    source.release(3);
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    // Complete with the file present is a no-op
    let done = manager.request("v1", URL).await.unwrap();
    assert_eq!(done.status, DownloadStatus::Complete);
    assert_eq!(source.open_count(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_validation() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, payload(300_000));
    let manager = manager_with(&dir, source).await;

    assert!(matches!(
        manager.request("v1", "file:///etc/passwd").await,
        Err(CoreError::InvalidInput(_))
    ));

    manager.request("v1", URL).await.unwrap();
    assert!(matches!(
        manager.request("v1", "https://media.example.com/other.mp4").await,
        Err(CoreError::InvalidInput(_))
    ));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_complete_file_is_downloaded_again() {
    let dir = TempDir::new().unwrap();
    let data = payload(300_000);
    let source = MemorySource::new(CHUNK);
    source.insert(URL, data.clone());

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    let path = manager.get("v1").await.unwrap().unwrap().local_path;
    std::fs::remove_file(&path).unwrap();

    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    assert_eq!(source.opens().last(), Some(&(URL.to_string(), 0)));
    assert_eq!(std::fs::read(&path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

/// Seed the manifest as if a previous process had crashed mid-transfer
async fn seed_interrupted(
    dir: &TempDir,
    status: DownloadStatus,
    persisted: u64,
    expected_size: u64,
    on_disk: &[u8],
) {
    let path = local_path_for(dir.path(), "v1");
    std::fs::write(&path, on_disk).unwrap();

    let mut item = DownloadItem::new(
        "v1".to_string(),
        URL.to_string(),
        path,
        RequestOptions::default(),
    );
    item.status = status;
    item.bytes_written = persisted;
    item.expected_size = Some(expected_size);

    ManifestStore::new(dir.path().join("manifest.json"))
        .save(&item)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_crash_recovery_resumes_from_persisted_offset() {
    let dir = TempDir::new().unwrap();
    let data = payload(1_000_000);

    // 500000 bytes reached the file, only 300000 were persisted
    seed_interrupted(&dir, DownloadStatus::InProgress, 300_000, 1_000_000, &data[..500_000]).await;

    let source = MemorySource::new(CHUNK);
    source.insert(URL, data.clone());
    let manager = manager_with(&dir, source.clone()).await;

    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(item.status, DownloadStatus::Paused);
    assert_eq!(item.bytes_written, 300_000);

    let mut events = manager.subscribe();
    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    assert_eq!(source.opens(), vec![(URL.to_string(), 300_000)]);
    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_size_mismatch_on_resume_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    seed_interrupted(&dir, DownloadStatus::Paused, 200_000, 1_000_000, &payload(200_000)).await;

    // The remote file changed size since the partial download
    let data = payload(800_000);
    let source = MemorySource::new(CHUNK);
    source.insert(URL, data.clone());

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    let error = wait_for_status(&mut events, "v1", DownloadStatus::Failed)
        .await
        .unwrap();
    assert_eq!(error.kind, ErrorKind::SizeMismatch);

    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    assert_eq!(
        source.opens(),
        vec![(URL.to_string(), 200_000), (URL.to_string(), 0)]
    );
    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(item.bytes_written, 800_000);
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_source_ignoring_ranges_restarts_cleanly() {
    let dir = TempDir::new().unwrap();
    let data = payload(600_000);
    seed_interrupted(&dir, DownloadStatus::Paused, 200_000, 600_000, &data[..200_000]).await;

    let source = MemorySource::new(CHUNK);
    source.insert(URL, data.clone());
    source.set_ignore_ranges(true);

    let manager = manager_with(&dir, source).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(item.bytes_written, 600_000);
    assert_eq!(std::fs::read(&item.local_path).unwrap(), data);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_playback_only_after_verified_completion() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, payload(300_000));

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    assert!(matches!(
        manager.playback("v1").await,
        Err(CoreError::NotFound(_))
    ));

    manager.request("v1", URL).await.unwrap();
    assert!(matches!(
        manager.playback("v1").await,
        Err(CoreError::NotPlayable { .. })
    ));

    source.release(3);
    wait_for_status(&mut events, "v1", DownloadStatus::Complete).await;

    let handle = manager.playback("v1").await.unwrap();
    let item = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(handle.path, item.local_path);
    assert_eq!(handle.size, 300_000);

    // Same length, different bytes
    std::fs::write(&item.local_path, vec![7u8; 300_000]).unwrap();
    assert!(matches!(
        manager.playback("v1").await,
        Err(CoreError::Integrity { .. })
    ));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_pauses_and_persists_active_transfers() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::gated(CHUNK);
    source.insert(URL, payload(TOTAL));

    let manager = manager_with(&dir, source.clone()).await;
    let mut events = manager.subscribe();

    manager.request("v1", URL).await.unwrap();
    source.release(2);
    wait_for_progress(&mut events, "v1", 200_000).await;

    manager.shutdown().await.unwrap();
    assert!(manager.list().await.is_err());

    let restarted = manager_with(&dir, MemorySource::new(CHUNK)).await;
    let item = restarted.get("v1").await.unwrap().unwrap();
    assert_eq!(item.status, DownloadStatus::Paused);
    assert_eq!(item.bytes_written, 200_000);

    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_parallel_downloads_and_list_order() {
    let dir = TempDir::new().unwrap();
    let other = "https://media.example.com/lessons/b.mp4";
    let source = MemorySource::new(CHUNK);
    source.insert(URL, payload(400_000));
    source.insert(other, payload(700_000));

    let manager = manager_with(&dir, source).await;
    let mut events = manager.subscribe();

    manager.request("a", URL).await.unwrap();
    manager.request("b", other).await.unwrap();

    let mut done = Vec::new();
    wait_for(&mut events, |event| {
        if let DownloadEvent::StatusChanged { id, new: DownloadStatus::Complete, .. } = event {
            done.push(id.clone());
        }
        done.len() == 2
    })
    .await;

    let listed: Vec<String> = manager
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.id)
        .collect();
    done.reverse();
    assert_eq!(listed, done);

    manager.shutdown().await.unwrap();
}
