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

//! Per-chunk state records for a single result set.
//!
//! The store holds one [`ChunkDescriptor`] per chunk index. Each stage of the
//! pipeline owns a fixed set of transitions (the resolver sets links, the
//! download worker drives download states, the consumer releases), so a
//! descriptor only ever has one writer at a time. The `DashMap` shard lock
//! makes each individual read-modify-write atomic.
//!
//! State transitions:
//! ```text
//!   Pending -> UrlFetched                      (link resolved)
//!   UrlFetched -> DownloadInProgress           (download started)
//!   DownloadInProgress -> DownloadSucceeded    (decoded)
//!   DownloadInProgress -> DownloadRetry        (transient failure)
//!   DownloadRetry -> UrlFetched                (link refreshed)
//!   DownloadRetry -> DownloadInProgress        (retry with same link)
//!   {Pending, UrlFetched, DownloadInProgress, DownloadRetry} -> DownloadFailed
//!   Pending -> ExtractSucceeded | ExtractFailed (inline results)
//!   any non-terminal -> Cancelled
//!   any -> Released                            (idempotent)
//! ```

use crate::error::{Error, Result};
use crate::types::cloudfetch::CloudFetchLink;
use crate::types::manifest::{ChunkInfo, CompressionCodec};
use dashmap::DashMap;
use tracing::{debug, trace};

/// Lifecycle state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Initial state, no link yet.
    Pending,
    /// Link available, not yet downloading.
    UrlFetched,
    /// Download (and decode) in progress.
    DownloadInProgress,
    /// Downloaded and decoded; rows are consumable.
    DownloadSucceeded,
    /// Last attempt failed transiently; waiting to retry.
    DownloadRetry,
    /// Retries exhausted or fatal failure (terminal).
    DownloadFailed,
    /// Inline payload decoded; rows are consumable.
    ExtractSucceeded,
    /// Inline payload could not be decoded (terminal).
    ExtractFailed,
    /// Cancelled by close (terminal).
    Cancelled,
    /// Memory released (terminal).
    Released,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkStatus::DownloadFailed
                | ChunkStatus::ExtractFailed
                | ChunkStatus::Cancelled
                | ChunkStatus::Released
        )
    }

    /// A link-resolved or pending chunk whose payload has not been fetched.
    pub fn is_awaiting_download(self) -> bool {
        matches!(
            self,
            ChunkStatus::Pending | ChunkStatus::UrlFetched | ChunkStatus::DownloadRetry
        )
    }

    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;

        match (self, next) {
            (_, Released) => self != Released,
            (from, Cancelled) => !from.is_terminal(),
            (Pending, UrlFetched | ExtractSucceeded | ExtractFailed) => true,
            (UrlFetched, DownloadInProgress) => true,
            (DownloadInProgress, DownloadSucceeded | DownloadRetry) => true,
            (DownloadRetry, UrlFetched | DownloadInProgress) => true,
            (Pending | UrlFetched | DownloadInProgress | DownloadRetry, DownloadFailed) => true,
            _ => false,
        }
    }
}

/// State record for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub index: i64,
    pub row_count: i64,
    pub row_offset: i64,
    pub compression: CompressionCodec,
    /// Most recently resolved link (set when state is UrlFetched or later).
    pub link: Option<CloudFetchLink>,
    pub status: ChunkStatus,
    pub error_message: Option<String>,
}

impl ChunkDescriptor {
    fn new(index: i64, row_count: i64, row_offset: i64, compression: CompressionCodec) -> Self {
        Self {
            index,
            row_count,
            row_offset,
            compression,
            link: None,
            status: ChunkStatus::Pending,
            error_message: None,
        }
    }
}

/// Table of chunk descriptors indexed by chunk index.
#[derive(Debug)]
pub struct ChunkStore {
    chunks: DashMap<i64, ChunkDescriptor>,
    total_chunks: i64,
}

impl ChunkStore {
    /// Build the store from the manifest's chunk list.
    ///
    /// Indices must be contiguous from 0 and row offsets must equal the
    /// running row total, so that `row_offset` strictly increases with index
    /// for every non-empty chunk.
    pub fn from_chunk_infos(chunks: &[ChunkInfo], compression: CompressionCodec) -> Result<Self> {
        let mut sorted: Vec<&ChunkInfo> = chunks.iter().collect();
        sorted.sort_by_key(|c| c.chunk_index);

        let map = DashMap::with_capacity(sorted.len());
        let mut expected_offset = 0i64;
        for (position, info) in sorted.iter().enumerate() {
            if info.chunk_index != position as i64 {
                return Err(Error::InvalidManifest(format!(
                    "chunk indices are not contiguous: expected {}, found {}",
                    position, info.chunk_index
                )));
            }
            if info.row_count < 0 {
                return Err(Error::InvalidManifest(format!(
                    "chunk {} has negative row count {}",
                    info.chunk_index, info.row_count
                )));
            }
            if info.row_offset != expected_offset {
                return Err(Error::InvalidManifest(format!(
                    "chunk {} has row offset {}, expected {}",
                    info.chunk_index, info.row_offset, expected_offset
                )));
            }
            expected_offset += info.row_count;
            map.insert(
                info.chunk_index,
                ChunkDescriptor::new(info.chunk_index, info.row_count, info.row_offset, compression),
            );
        }

        debug!(
            "Chunk store initialized: {} chunks, {} rows",
            sorted.len(),
            expected_offset
        );

        Ok(Self {
            chunks: map,
            total_chunks: sorted.len() as i64,
        })
    }

    /// Store for a single inline chunk. A row count of `None` means the
    /// declared count is unknown and is not checked after decoding.
    pub fn single_inline(row_count: Option<i64>, compression: CompressionCodec) -> Self {
        let chunks = DashMap::with_capacity(1);
        chunks.insert(
            0,
            ChunkDescriptor::new(0, row_count.unwrap_or(-1), 0, compression),
        );
        Self {
            chunks,
            total_chunks: 1,
        }
    }

    pub fn total_chunks(&self) -> i64 {
        self.total_chunks
    }

    pub fn total_row_count(&self) -> i64 {
        self.chunks
            .iter()
            .map(|entry| entry.row_count.max(0))
            .sum()
    }

    /// Copy of the descriptor for `chunk_index`.
    pub fn descriptor(&self, chunk_index: i64) -> Result<ChunkDescriptor> {
        self.chunks
            .get(&chunk_index)
            .map(|entry| entry.clone())
            .ok_or_else(|| Self::unknown_chunk(chunk_index))
    }

    pub fn status(&self, chunk_index: i64) -> Result<ChunkStatus> {
        self.chunks
            .get(&chunk_index)
            .map(|entry| entry.status)
            .ok_or_else(|| Self::unknown_chunk(chunk_index))
    }

    pub fn link(&self, chunk_index: i64) -> Option<CloudFetchLink> {
        self.chunks
            .get(&chunk_index)
            .and_then(|entry| entry.link.clone())
    }

    /// Install a freshly resolved link.
    ///
    /// A pending chunk moves to `UrlFetched`. Chunks already holding a link
    /// but not yet downloading get the new link in place of the old one.
    /// Chunks past that point are left alone; returns whether the link was
    /// installed.
    pub fn set_link(&self, chunk_index: i64, link: CloudFetchLink) -> Result<bool> {
        let mut entry = self
            .chunks
            .get_mut(&chunk_index)
            .ok_or_else(|| Self::unknown_chunk(chunk_index))?;

        match entry.status {
            ChunkStatus::Pending => {
                entry.link = Some(link);
                entry.status = ChunkStatus::UrlFetched;
                trace!("Chunk {}: Pending -> UrlFetched", chunk_index);
                Ok(true)
            }
            ChunkStatus::UrlFetched | ChunkStatus::DownloadRetry => {
                entry.link = Some(link);
                trace!("Chunk {}: link replaced", chunk_index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Apply a validated state transition.
    pub fn transition(&self, chunk_index: i64, next: ChunkStatus) -> Result<()> {
        let mut entry = self
            .chunks
            .get_mut(&chunk_index)
            .ok_or_else(|| Self::unknown_chunk(chunk_index))?;

        let current = entry.status;
        if !current.can_transition_to(next) {
            return Err(Error::state(format!(
                "chunk {} cannot move from {:?} to {:?}",
                chunk_index, current, next
            )));
        }

        entry.status = next;
        trace!("Chunk {}: {:?} -> {:?}", chunk_index, current, next);
        Ok(())
    }

    /// Move to a failure state, recording the message.
    pub fn fail(&self, chunk_index: i64, next: ChunkStatus, message: &str) -> Result<()> {
        self.transition(chunk_index, next)?;
        if let Some(mut entry) = self.chunks.get_mut(&chunk_index) {
            entry.error_message = Some(message.to_string());
        }
        Ok(())
    }

    /// Mark a chunk released. The first call returns `true`; later calls
    /// are no-ops returning `false`.
    pub fn release(&self, chunk_index: i64) -> Result<bool> {
        let mut entry = self
            .chunks
            .get_mut(&chunk_index)
            .ok_or_else(|| Self::unknown_chunk(chunk_index))?;

        if entry.status == ChunkStatus::Released {
            return Ok(false);
        }
        trace!("Chunk {}: {:?} -> Released", chunk_index, entry.status);
        entry.status = ChunkStatus::Released;
        entry.link = None;
        Ok(true)
    }

    /// Close out every chunk when the result is closed: chunks still in the
    /// download pipeline are cancelled, chunks holding unconsumed decoded rows
    /// are released. Returns how many chunks were cancelled.
    pub fn cancel_outstanding(&self) -> usize {
        let mut cancelled = 0;
        let mut released = 0;
        for mut entry in self.chunks.iter_mut() {
            match entry.status {
                ChunkStatus::DownloadSucceeded | ChunkStatus::ExtractSucceeded => {
                    entry.status = ChunkStatus::Released;
                    entry.link = None;
                    released += 1;
                }
                status if !status.is_terminal() => {
                    entry.status = ChunkStatus::Cancelled;
                    cancelled += 1;
                }
                _ => {}
            }
        }
        debug!(
            "Closed chunk store: {} chunks cancelled, {} released",
            cancelled, released
        );
        cancelled
    }

    fn unknown_chunk(chunk_index: i64) -> Error {
        Error::state(format!("chunk {} is not part of this result", chunk_index))
    }
}
