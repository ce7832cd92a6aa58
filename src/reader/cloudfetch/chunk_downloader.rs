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

//! ChunkDownloader for downloading Arrow data from cloud storage.
//!
//! This module handles a single download attempt: fetching the payload from
//! a presigned URL, speed monitoring, decompression and Arrow IPC decoding.
//! Retries live in [`download_workers`](super::download_workers).

use crate::error::{Error, Result};
use crate::reader::batch_set::DecodedBatchSet;
use crate::reader::cloudfetch::arrow_parser::parse_arrow_ipc;
use crate::types::cloudfetch::CloudFetchLink;
use crate::types::manifest::CompressionCodec;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Transport used to fetch a chunk's raw (possibly compressed) payload.
///
/// A single call is a single attempt: implementations must not retry.
#[async_trait]
pub trait ChunkPayloadFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, link: &CloudFetchLink) -> Result<Vec<u8>>;
}

/// Downloads and decodes one chunk.
///
/// Handles:
/// - Fetching the payload through a [`ChunkPayloadFetcher`]
/// - LZ4 decompression (if compression enabled)
/// - Arrow IPC stream decoding into a [`DecodedBatchSet`]
/// - Download speed monitoring
#[derive(Debug)]
pub struct ChunkDownloader {
    fetcher: Arc<dyn ChunkPayloadFetcher>,
    compression: CompressionCodec,
    speed_threshold_mbps: f64,
}

impl ChunkDownloader {
    /// Create a new chunk downloader.
    ///
    /// # Arguments
    /// * `fetcher` - Transport for presigned URLs
    /// * `compression` - Compression codec used by the server
    /// * `speed_threshold_mbps` - Log warning if speed falls below this (MB/s)
    pub fn new(
        fetcher: Arc<dyn ChunkPayloadFetcher>,
        compression: CompressionCodec,
        speed_threshold_mbps: f64,
    ) -> Self {
        Self {
            fetcher,
            compression,
            speed_threshold_mbps,
        }
    }

    /// Download and decode the chunk behind `link`.
    ///
    /// `expected_rows` is the row count declared by the manifest; a decoded
    /// chunk with a different row count is rejected and its batches freed.
    pub async fn download(
        &self,
        link: &CloudFetchLink,
        expected_rows: i64,
    ) -> Result<DecodedBatchSet> {
        let start = Instant::now();

        debug!(
            "Downloading chunk {} ({} bytes expected)",
            link.chunk_index, link.byte_count
        );

        let bytes = self.fetcher.fetch(link).await?;

        let elapsed = start.elapsed();
        let size_mb = bytes.len() as f64 / 1024.0 / 1024.0;
        let speed_mbps = size_mb / elapsed.as_secs_f64();

        debug!(
            "Downloaded chunk {}: {:.2} MB in {:.2}s ({:.2} MB/s)",
            link.chunk_index,
            size_mb,
            elapsed.as_secs_f64(),
            speed_mbps
        );

        if speed_mbps < self.speed_threshold_mbps {
            warn!(
                "CloudFetch download slower than threshold: {:.2} MB/s (threshold: {:.2} MB/s)",
                speed_mbps, self.speed_threshold_mbps
            );
        }

        let mut set = parse_arrow_ipc(&bytes, self.compression)?;

        if expected_rows >= 0 && set.num_rows() as i64 != expected_rows {
            let decoded = set.num_rows();
            set.release();
            return Err(Error::decode(format!(
                "chunk {} decoded {} rows, manifest declares {}",
                link.chunk_index, decoded, expected_rows
            )));
        }

        debug!(
            "Parsed chunk {}: {} batches, {} total rows",
            link.chunk_index,
            set.batches().len(),
            set.num_rows()
        );

        Ok(set)
    }
}
