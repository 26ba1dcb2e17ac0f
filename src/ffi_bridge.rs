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


//! C FFI bridge - exposes the download manager to the mobile shell
//!
//! # Architecture
//! JavaScript (React Native) → Swift/Kotlin native module → C FFI → Rust
//!
//! # Design Patterns
//! 1. **JSON Communication**: All complex data is serialized to JSON for FFI crossing
//! 2. **Error Handling**: All errors are caught and returned as JSON error responses
//! 3. **Async Runtime**: One lazily created tokio runtime drives the manager
//! 4. **No Panics**: All panics are caught to prevent crashes across FFI boundary
//! 5. **Memory Safety**: All returned strings must be freed by caller using `offline_media_free_string()`
//!
//! # Lifecycle
//! `offline_media_init(config_json)` loads the manifest and starts the one
//! process-wide manager. `offline_media_shutdown()` flushes pending state and
//! stops it. Events are buffered and drained with `offline_media_poll_events()`.
//!
//! # Response Format
//! ```json
//! { "success": true, "data": { ... } }
//! ```
//! Or on error:
//! ```json
//! { "success": false, "error": "Error message" }
//! ```

use crate::config::ManagerConfig;
use crate::download::{DownloadEvent, DownloadManager, RequestOptions};
use crate::error::{CoreError, Result};
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic;
use std::sync::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;
use tracing::warn;

lazy_static::lazy_static! {
    static ref RUNTIME: std::io::Result<Runtime> = Runtime::new();
    static ref STATE: Mutex<Option<BridgeState>> = Mutex::new(None);
}

struct BridgeState {
    manager: DownloadManager,
    events: Receiver<DownloadEvent>,
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn runtime() -> Result<&'static Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|e| CoreError::internal(format!("Failed to create Tokio runtime: {}", e)))
}

fn lock_state() -> Result<std::sync::MutexGuard<'static, Option<BridgeState>>> {
    STATE
        .lock()
        .map_err(|_| CoreError::internal("Bridge state lock poisoned"))
}

/// Clone of the running manager
fn manager() -> Result<DownloadManager> {
    lock_state()?
        .as_ref()
        .map(|state| state.manager.clone())
        .ok_or_else(|| CoreError::InvalidState("offline_media_init has not been called".to_string()))
}

/// Safely convert C string pointer to Rust String
///
/// # Safety
/// Caller must ensure ptr is a valid null-terminated C string
fn c_str_to_string(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(CoreError::invalid_input("Null pointer received"));
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| CoreError::invalid_input(format!("Invalid UTF-8: {}", e)))
    }
}

/// Like [`c_str_to_string`], but null means "not given"
fn optional_c_str(ptr: *const c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        c_str_to_string(ptr).map(Some)
    }
}

/// Convert Rust string to C string pointer
///
/// # Safety
/// Caller MUST free the returned pointer using `offline_media_free_string()`
fn string_to_c_str(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c_string) => c_string.into_raw(),
        Err(_) => CString::new(error_response("String contains null bytes"))
            .unwrap_or_default()
            .into_raw(),
    }
}

fn success_response<T: Serialize>(data: T) -> String {
    serde_json::json!({
        "success": true,
        "data": data
    })
    .to_string()
}

fn error_response(error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Run `f`, turning errors and panics into error responses
fn respond<T, F>(f: F) -> *mut c_char
where
    T: Serialize,
    F: FnOnce() -> Result<T>,
{
    let response = match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
        Ok(Ok(data)) => success_response(data),
        Ok(Err(e)) => error_response(&e.user_message()),
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    };
    string_to_c_str(response)
}

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Load the manifest and start the manager
///
/// `config_json` is a (possibly partial) `ManagerConfig` document; at least
/// `download_dir` should be set. Returns `{ "health": { "state": ... } }`.
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_init(config_json: *const c_char) -> *mut c_char {
    respond(|| {
        let config = ManagerConfig::from_json(&c_str_to_string(config_json)?)?;

        let mut state = lock_state()?;
        if state.is_some() {
            return Err(CoreError::InvalidState(
                "Download manager is already running".to_string(),
            ));
        }

        let runtime = runtime()?;
        let manager = runtime.block_on(DownloadManager::start(config))?;
        let health = runtime.block_on(manager.health())?;
        let events = manager.subscribe();

        *state = Some(BridgeState { manager, events });
        Ok(serde_json::json!({ "health": health }))
    })
}

/// Flush pending state and stop the manager; a no-op if not running
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_shutdown() -> *mut c_char {
    respond(|| {
        let Some(state) = lock_state()?.take() else {
            return Ok(());
        };
        runtime()?.block_on(state.manager.shutdown())
    })
}

// ============================================================================
// DOWNLOADS
// ============================================================================

/// Start or resume a download
///
/// `options_json` may be null or `{ "display_name": ..., "expected_checksum": ... }`.
/// Returns the item as stored.
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_request(
    id: *const c_char,
    url: *const c_char,
    options_json: *const c_char,
) -> *mut c_char {
    respond(|| {
        let id = c_str_to_string(id)?;
        let url = c_str_to_string(url)?;
        let options: RequestOptions = match optional_c_str(options_json)? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| CoreError::invalid_input(format!("Invalid options: {}", e)))?,
            None => RequestOptions::default(),
        };

        let manager = manager()?;
        runtime()?.block_on(manager.request_with(&id, &url, options))
    })
}

/// Pause an active download
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_cancel(id: *const c_char) -> *mut c_char {
    respond(|| {
        let id = c_str_to_string(id)?;
        let manager = manager()?;
        runtime()?.block_on(manager.cancel(&id))
    })
}

/// Delete an item and its file; returns a `DeleteReport`
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_delete(id: *const c_char) -> *mut c_char {
    respond(|| {
        let id = c_str_to_string(id)?;
        let manager = manager()?;
        runtime()?.block_on(manager.delete(&id))
    })
}

/// All items, most recently updated first
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_list() -> *mut c_char {
    respond(|| {
        let manager = manager()?;
        runtime()?.block_on(manager.list())
    })
}

/// One item, or `null` data if unknown
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_get(id: *const c_char) -> *mut c_char {
    respond(|| {
        let id = c_str_to_string(id)?;
        let manager = manager()?;
        runtime()?.block_on(manager.get(&id))
    })
}

/// Manifest health (`healthy` or `degraded` with a reason)
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_health() -> *mut c_char {
    respond(|| {
        let manager = manager()?;
        runtime()?.block_on(manager.health())
    })
}

// ============================================================================
// PLAYBACK & EVENTS
// ============================================================================

/// Validated playback handle (`path`, `size`, `checksum`) for a complete item
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_playback(id: *const c_char) -> *mut c_char {
    respond(|| {
        let id = c_str_to_string(id)?;
        let manager = manager()?;
        runtime()?.block_on(manager.playback(&id))
    })
}

/// Drain events buffered since the last poll
///
/// If the UI polls too slowly the oldest events are dropped; a fresh
/// `offline_media_list()` resynchronises.
///
/// # Safety
/// Caller must free the returned string with `offline_media_free_string()`
#[no_mangle]
pub extern "C" fn offline_media_poll_events() -> *mut c_char {
    respond(|| {
        let mut guard = lock_state()?;
        let Some(state) = guard.as_mut() else {
            return Err(CoreError::InvalidState(
                "offline_media_init has not been called".to_string(),
            ));
        };

        let mut events = Vec::new();
        loop {
            match state.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event buffer overflowed, oldest events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(events)
    })
}

/// Free a string returned by any `offline_media_*` function
///
/// # Safety
/// `ptr` must come from this library and must not be used afterwards
#[no_mangle]
pub extern "C" fn offline_media_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr));
    }
}
