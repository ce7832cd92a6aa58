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

//! CloudFetch implementation for streaming Arrow data from cloud storage.
//!
//! This module provides:
//! - `LinkResolver`: Serial, single-flight resolution of presigned chunk links
//! - `ChunkDownloader`: One download attempt: fetch, decompress, decode
//! - `RetryingDownloader` and the download worker pool
//! - `ChunkScheduler`: Ordered hand-off of downloaded chunks to the consumer
//! - Arrow IPC parsing utilities

pub mod arrow_parser;
pub mod chunk_downloader;
pub mod download_workers;
pub mod link_resolver;
pub mod pipeline_types;
pub mod scheduler;

pub use arrow_parser::{decode_chunk, decompress, parse_arrow_ipc};
pub use chunk_downloader::{ChunkDownloader, ChunkPayloadFetcher};
pub use download_workers::{spawn_download_workers, RetryingDownloader};
pub use link_resolver::{ChunkLinkResolver, LinkResolver};
pub use scheduler::ChunkScheduler;
