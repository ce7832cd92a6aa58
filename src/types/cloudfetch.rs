// Copyright (c) 2025 ADBC Drivers Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CloudFetch-specific types for streaming downloads.
//!
//! These types are used by the link resolver, the download workers and the
//! chunk scheduler for downloading Arrow data from cloud storage via
//! presigned URLs.

use crate::error::{Error, Result};
use crate::types::manifest::ExternalLink;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Safety buffer (in seconds) before link expiration.
/// Links are considered expired this many seconds before their actual expiration time
/// so a download never starts on a link that dies mid-transfer.
pub const LINK_EXPIRY_BUFFER_SECS: i64 = 60;

/// Configuration for CloudFetch streaming.
#[derive(Debug, Clone)]
pub struct CloudFetchConfig {
    /// Number of parallel download workers. Also bounds the number of chunks
    /// that are downloading or downloaded-but-unconsumed at any time.
    pub max_concurrent_downloads: usize,
    /// Maximum number of download attempts per chunk.
    pub max_retries: u32,
    /// Fixed delay between download attempts.
    pub retry_delay: Duration,
    /// Log warning if download speed falls below this threshold (MB/s).
    pub speed_threshold_mbps: f64,
    /// Whether CloudFetch is enabled.
    pub enabled: bool,
}

impl Default for CloudFetchConfig {
    fn default() -> Self {
        Self {
            // Match JDBC default: cloudFetchThreadPoolSize = 16
            max_concurrent_downloads: 16,
            max_retries: 5,
            retry_delay: Duration::from_millis(1500),
            speed_threshold_mbps: 0.1,
            enabled: true,
        }
    }
}

/// A presigned link granting read access to one chunk's remote payload.
///
/// Links are replaced wholesale when refreshed, never mutated in place, so a
/// task holding an old clone keeps a consistent (if stale) value.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudFetchLink {
    /// Pre-signed URL for downloading the chunk.
    pub url: String,
    /// Index of this chunk in the result set.
    pub chunk_index: i64,
    /// Row offset of this chunk in the result set.
    pub row_offset: i64,
    /// Number of rows in this chunk.
    pub row_count: i64,
    /// Size of this chunk in bytes (compressed if applicable).
    pub byte_count: i64,
    /// When this link expires.
    pub expiration: DateTime<Utc>,
    /// HTTP headers to include in the download request.
    pub http_headers: HashMap<String, String>,
}

impl CloudFetchLink {
    /// Check if link is expired (with safety buffer).
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against an explicit clock reading.
    ///
    /// A link is expired when `now + LINK_EXPIRY_BUFFER_SECS >= expiration`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(LINK_EXPIRY_BUFFER_SECS) >= self.expiration
    }

    /// Convert from the API's external link representation.
    pub fn from_external_link(link: &ExternalLink) -> Result<Self> {
        let expiration = DateTime::parse_from_rfc3339(&link.expiration)
            .map_err(|e| {
                Error::InvalidManifest(format!(
                    "Invalid expiration timestamp for chunk {}: {}",
                    link.chunk_index, e
                ))
            })?
            .with_timezone(&Utc);

        Ok(Self {
            url: link.external_link.clone(),
            chunk_index: link.chunk_index,
            row_offset: link.row_offset,
            row_count: link.row_count,
            byte_count: link.byte_count,
            expiration,
            http_headers: link.http_headers.clone().unwrap_or_default(),
        })
    }
}
