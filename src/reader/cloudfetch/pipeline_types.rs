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

//! Pipeline types for the two-channel CloudFetch download pipeline.
//!
//! - `ChunkDownloadTask` - Sent through the download channel, owned by a download worker
//! - `ChunkHandle` - Sent through the result channel in chunk-index order, awaited by the consumer
//!
//! ```text
//! [Scheduler] --> download_channel --> [Download Workers]
//!      |               |                      |
//!      |        ChunkDownloadTask      (resolve, fetch, decode)
//!      |                                      |
//!      v                                      v
//! result_channel (bounded) --> ChunkHandle <-- oneshot
//!      |
//!      v
//! [Consumer] awaits handles in order
//! ```

use crate::error::{Error, Result};
use crate::reader::batch_set::DecodedBatchSet;
use tokio::sync::oneshot;

/// A download task sent to download workers.
///
/// The worker resolves the chunk's link itself, so the task only carries the
/// chunk index and the sender half of the result oneshot.
#[derive(Debug)]
pub struct ChunkDownloadTask {
    /// Index of this chunk in the result set.
    pub chunk_index: i64,
    /// Consumed by the worker when it sends the download outcome.
    pub result_tx: oneshot::Sender<Result<DecodedBatchSet>>,
}

/// A handle for the consumer to await a download result.
///
/// Handles travel through the result channel in chunk-index order, so the
/// consumer sees chunks in order whatever order the downloads complete in.
#[derive(Debug)]
pub struct ChunkHandle {
    /// Index of this chunk in the result set.
    pub chunk_index: i64,
    pub result_rx: oneshot::Receiver<Result<DecodedBatchSet>>,
}

impl ChunkHandle {
    /// Wait for the worker's outcome. A worker that went away without
    /// answering (cancelled pipeline) yields `Error::Cancelled`.
    pub async fn wait(self) -> Result<DecodedBatchSet> {
        let chunk_index = self.chunk_index;
        self.result_rx.await.map_err(|_| {
            Error::cancelled(format!("download of chunk {} was abandoned", chunk_index))
        })?
    }
}

/// Creates a connected (ChunkDownloadTask, ChunkHandle) pair.
pub fn create_chunk_pair(chunk_index: i64) -> (ChunkDownloadTask, ChunkHandle) {
    let (result_tx, result_rx) = oneshot::channel();

    let task = ChunkDownloadTask {
        chunk_index,
        result_tx,
    };

    let handle = ChunkHandle {
        chunk_index,
        result_rx,
    };

    (task, handle)
}
