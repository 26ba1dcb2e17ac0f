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


//! Remote source abstraction for transfers
//!
//! A transfer only needs three things from the remote side: the body stream,
//! the full resource size, and whether the server honoured a resume offset.
//! [`RemoteSource`] captures that contract so transports other than HTTP (and
//! test doubles) can stand in for [`HttpSource`].
//!
//! # Resume Mechanism
//! 1. Send Range header: `bytes={offset}-`
//! 2. `206 Partial Content` with `Content-Range: bytes {offset}-{end}/{total}` → resumed
//! 3. `200 OK` → server ignored the range; caller restarts from zero
//! 4. `416 Range Not Satisfiable` → the resource no longer matches the partial file

use crate::config::ManagerConfig;
use crate::error::{CoreError, Result};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Opened remote resource
pub struct RemoteResponse {
    /// Body starts at the requested offset (otherwise at byte zero)
    pub resumed: bool,
    /// Full size of the resource, if the server said
    pub total_size: Option<u64>,
    /// Body chunks
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for RemoteResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteResponse")
            .field("resumed", &self.resumed)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Trait for fetching a remote resource from a byte offset
pub trait RemoteSource: Send + Sync {
    /// Open `url`, asking for the bytes from `offset` onwards
    ///
    /// An implementation that cannot resume returns `resumed: false` and the
    /// body from byte zero.
    fn open(&self, url: &str, offset: u64) -> BoxFuture<'static, Result<RemoteResponse>>;
}

/// Parsed `Content-Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// Parse `bytes 1000-1999/2000` (total may be `*`)
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }

    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };

    Some(ContentRange { start, end, total })
}

/// Parse the size out of an unsatisfied range: `bytes */2000`
fn parse_unsatisfied_range(value: &str) -> Option<u64> {
    value.trim().strip_prefix("bytes */")?.trim().parse().ok()
}

/// HTTP(S) implementation using reqwest
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| CoreError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn open_inner(client: Client, url: String, offset: u64) -> Result<RemoteResponse> {
        let mut request = client.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers();

        let content_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(%url, offset, status = status.as_u16(), "Remote responded");

        let (resumed, total_size) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = content_range
                    .as_deref()
                    .and_then(parse_content_range)
                    .ok_or_else(|| {
                        CoreError::network_error("206 response without a valid Content-Range", false)
                    })?;

                if range.start != offset {
                    return Err(CoreError::SizeMismatch {
                        expected: offset,
                        actual: range.start,
                    });
                }

                (true, range.total)
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let actual = content_range
                    .as_deref()
                    .and_then(parse_unsatisfied_range)
                    .unwrap_or(0);
                return Err(CoreError::SizeMismatch {
                    expected: offset,
                    actual,
                });
            }
            s if s.is_success() => (false, response.content_length()),
            s => return Err(CoreError::http_status(s.as_u16(), &url)),
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CoreError::from))
            .boxed();

        Ok(RemoteResponse {
            resumed,
            total_size,
            body,
        })
    }
}

impl RemoteSource for HttpSource {
    fn open(&self, url: &str, offset: u64) -> BoxFuture<'static, Result<RemoteResponse>> {
        Box::pin(Self::open_inner(self.client.clone(), url.to_string(), offset))
    }
}
