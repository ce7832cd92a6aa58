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

//! Clients for the services a result reader talks to.
//!
//! This module provides:
//! - `ResultLinkClient` trait: the statement-execution backend's link listing RPC
//! - `HttpChunkFetcher`: plain HTTP GET of presigned chunk URLs

pub mod http;

use crate::error::Result;
use crate::types::cloudfetch::CloudFetchLink;
use async_trait::async_trait;

pub use http::{HttpChunkFetcher, HttpClientConfig};

/// Link listing interface of the statement-execution backend.
///
/// Session management and statement execution live outside this crate; the
/// reader only needs to ask for more presigned links once the links that came
/// with the execute response run out or expire.
#[async_trait]
pub trait ResultLinkClient: Send + Sync + std::fmt::Debug {
    /// List presigned links for `statement_id` starting at `start_chunk_index`.
    ///
    /// The backend returns a contiguous, ascending run of links whose first
    /// element is for `start_chunk_index`. The run may end anywhere before the
    /// last chunk; callers continue from the index after the last link.
    async fn list_result_links(
        &self,
        statement_id: &str,
        start_chunk_index: i64,
    ) -> Result<Vec<CloudFetchLink>>;
}
