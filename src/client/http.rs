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

//! HTTP transport for CloudFetch chunk payloads.
//!
//! Presigned URLs carry their own authorization, so requests are sent with
//! the link's headers only. The transport makes exactly one attempt per call;
//! retries belong to the download workers, which also refresh links. A 401,
//! 403 or 404 from storage means the link itself is dead and is reported as
//! [`Error::LinkRejected`].

use crate::error::{Error, Result};
use crate::reader::cloudfetch::chunk_downloader::ChunkPayloadFetcher;
use crate::types::cloudfetch::CloudFetchLink;
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;

/// Configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Connection timeout duration.
    pub connect_timeout: Duration,
    /// Read timeout duration (whole request).
    pub read_timeout: Duration,
    /// Maximum number of idle connections per host.
    pub max_connections_per_host: usize,
    /// User agent string.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            max_connections_per_host: 100,
            user_agent: format!("databricks-cloudfetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Fetches chunk payloads from presigned URLs.
///
/// Connection pooling is handled by reqwest; one fetcher is shared by every
/// download worker of a reader.
#[derive(Debug, Clone)]
pub struct HttpChunkFetcher {
    client: Client,
    config: HttpClientConfig,
}

impl HttpChunkFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

#[async_trait]
impl ChunkPayloadFetcher for HttpChunkFetcher {
    async fn fetch(&self, link: &CloudFetchLink) -> Result<Vec<u8>> {
        let chunk_index = link.chunk_index;
        let mut request_builder = self.client.request(Method::GET, &link.url);
        for (key, value) in &link.http_headers {
            request_builder = request_builder.header(key, value);
        }

        debug!("GET chunk {} ({} bytes expected)", chunk_index, link.byte_count);

        let response = request_builder.send().await.map_err(|e| {
            Error::download(chunk_index, format!("HTTP request failed: {}", e))
        })?;

        let status = response.status();
        if is_link_rejection(status.as_u16()) {
            return Err(Error::LinkRejected {
                chunk_index,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(Error::download(
                chunk_index,
                format!("HTTP {} - {}", status.as_u16(), error_body),
            ));
        }

        let bytes = response.bytes().await.map_err(|e| {
            Error::download(
                chunk_index,
                format!("Failed to read download response: {}", e),
            )
        })?;

        Ok(bytes.to_vec())
    }
}

/// Statuses storage answers with once a presigned URL is expired or revoked.
fn is_link_rejection(status: u16) -> bool {
    matches!(status, 401 | 403 | 404)
}
