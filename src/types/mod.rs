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

//! Type definitions for CloudFetch result retrieval.
//!
//! - `manifest`: result manifest and result data handed over by statement execution
//! - `cloudfetch`: CloudFetch-specific types for streaming downloads

pub mod cloudfetch;
pub mod manifest;

pub use cloudfetch::{CloudFetchConfig, CloudFetchLink, LINK_EXPIRY_BUFFER_SECS};
pub use manifest::{
    ChunkInfo, ColumnInfo, CompressionCodec, ExternalLink, ResultData, ResultManifest,
    ResultSchema,
};
