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

//! Error types for CloudFetch result retrieval.
//!
//! Errors are `Clone` because a single batch-fetch failure is delivered to
//! every waiter of every outstanding link resolution slot.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a chunk link could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkResolutionError {
    /// The requested chunk index is outside `0..total_chunks`.
    #[error("chunk index {chunk_index} out of range (total chunks: {total_chunks})")]
    OutOfRange { chunk_index: i64, total_chunks: i64 },
    /// The resolver has been shut down; no further links are issued.
    #[error("link resolver has been shut down")]
    Shutdown,
    /// The batch link RPC failed. Fails every chunk still awaiting a link.
    #[error("failed to list result links: {0}")]
    Rpc(String),
}

/// Errors surfaced by the result retrieval pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    LinkResolution(#[from] LinkResolutionError),

    #[error("chunk {chunk_index} download failed: {message}")]
    Download { chunk_index: i64, message: String },

    /// Storage refused the presigned link (HTTP 401, 403 or 404). The link
    /// is dead whatever its advertised expiration says.
    #[error("chunk {chunk_index} link rejected by storage: HTTP {status}")]
    LinkRejected { chunk_index: i64, status: u16 },

    #[error("failed to decode chunk data: {0}")]
    Decode(String),

    #[error("invalid chunk state: {0}")]
    State(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid result manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid value '{value}' for option '{key}'")]
    InvalidOption { key: String, value: String },

    #[error("HTTP transport error: {0}")]
    Transport(String),
}

impl Error {
    pub(crate) fn download(chunk_index: i64, message: impl Into<String>) -> Self {
        Self::Download {
            chunk_index,
            message: message.into(),
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub(crate) fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    pub(crate) fn invalid_option(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether a download attempt that failed with this error may be retried.
    ///
    /// Network, HTTP and decode failures are transient. A rejected link is
    /// retried with a freshly resolved one. A failed batch link
    /// RPC is retried too: the next `resolve` restarts the fetch chain.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Download { .. } | Error::LinkRejected { .. } | Error::Decode(_) => true,
            Error::LinkResolution(LinkResolutionError::Rpc(_)) => true,
            _ => false,
        }
    }

    /// Whether storage refused the link itself, so retrying needs a new one.
    pub fn is_link_rejected(&self) -> bool {
        matches!(self, Error::LinkRejected { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}
