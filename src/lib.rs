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

//! Chunked CloudFetch result retrieval for Databricks SQL clients.
//!
//! A succeeded statement hands over a [`ResultManifest`] describing how its
//! result is split into chunks, plus [`ResultData`] carrying either presigned
//! links to some of those chunks or an inline Arrow attachment. This crate
//! turns that into a pull-based row cursor:
//!
//! - [`LinkResolver`](reader::cloudfetch::LinkResolver) resolves presigned
//!   links with one batch RPC in flight at a time and recovers from expiry
//! - download workers fetch, decompress and decode chunks in parallel with a
//!   bounded, fixed-delay retry policy
//! - [`ChunkScheduler`](reader::cloudfetch::ChunkScheduler) hands decoded
//!   chunks to the consumer in index order, bounding memory by the worker
//!   pool size
//! - [`InlineChunkAdapter`](reader::inline::InlineChunkAdapter) presents an
//!   inline attachment as a single chunk, so both delivery modes share the
//!   same cursor
//!
//! ## Example
//!
//! ```ignore
//! use databricks_cloudfetch::{ReaderOptions, ResultReaderFactory};
//!
//! let options = ReaderOptions::from_pairs([
//!     ("cloudfetch.max_concurrent_downloads", "8"),
//!     ("http.read_timeout_ms", "120000"),
//! ])?;
//! let factory = ResultReaderFactory::with_http(link_client, &options, runtime.handle().clone())?;
//!
//! let mut reader = factory.create_reader(&statement_id, &manifest, &result)?;
//! while reader.next().await? {
//!     let id = reader.column_value(0)?;
//! }
//! reader.close();
//! ```
//!
//! See [`options`] for the supported option keys.

pub mod client;
pub mod error;
pub(crate) mod logging;
pub mod options;
pub mod reader;
pub mod types;

pub use client::{HttpChunkFetcher, HttpClientConfig, ResultLinkClient};
pub use error::{Error, LinkResolutionError, Result};
pub use options::ReaderOptions;
pub use reader::{BlockingRowReader, ResultReaderFactory, ResultRowReader};
pub use types::{CloudFetchConfig, CloudFetchLink, ResultData, ResultManifest};
