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

//! Pull-based row cursors over a [`ChunkSource`].

use crate::error::{Error, Result};
use crate::reader::batch_set::{BatchRowCursor, RawValue};
use crate::reader::{ChunkSource, LoadedChunk};
use arrow_schema::SchemaRef;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// Row cursor over the chunks of one result.
///
/// Rows come out in ascending `(chunk index, row)` order. Chunks without rows
/// are skipped, and each chunk is released as soon as the cursor moves past
/// its last row. A chunk that failed to download surfaces as an error from
/// `has_next`/`next` when the cursor reaches it; calling `next` again moves on
/// to the following chunk.
#[derive(Debug)]
pub struct ResultRowReader {
    source: Box<dyn ChunkSource>,
    current: Option<LoadedChunk>,
    cursor: BatchRowCursor,
    /// Non-empty chunk pulled by `has_next` but not yet entered by `next`.
    lookahead: Option<LoadedChunk>,
    rows_returned: u64,
    closed: bool,
}

impl ResultRowReader {
    pub fn new(source: Box<dyn ChunkSource>) -> Self {
        Self {
            source,
            current: None,
            cursor: BatchRowCursor::new(),
            lookahead: None,
            rows_returned: 0,
            closed: false,
        }
    }

    /// Schema of the result: taken from decoded data when a chunk is loaded,
    /// otherwise the schema declared up front, if any.
    pub fn schema(&self) -> Option<SchemaRef> {
        self.current
            .as_ref()
            .or(self.lookahead.as_ref())
            .map(|chunk| chunk.set().schema().clone())
            .or_else(|| self.source.schema())
    }

    /// Whether another row is available. May wait for the next chunk.
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if let Some(chunk) = &self.current {
            if self.cursor.has_next_row(chunk.set()) {
                return Ok(true);
            }
        }
        if self.lookahead.is_some() {
            return Ok(true);
        }

        while self.source.has_next_chunk() {
            let chunk = self.source.next_chunk().await?;
            if chunk.num_rows() > 0 {
                self.lookahead = Some(chunk);
                return Ok(true);
            }
            trace!("Skipping chunk {} with no rows", chunk.index());
        }
        Ok(false)
    }

    /// Advance to the next row. Returns `false` at the end of the result.
    pub async fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::state("result reader is closed"));
        }

        if let Some(chunk) = &self.current {
            if self.cursor.next_row(chunk.set()) {
                self.rows_returned += 1;
                return Ok(true);
            }
        }

        if let Some(mut finished) = self.current.take() {
            trace!("Chunk {} consumed, releasing", finished.index());
            finished.release();
        }

        loop {
            let chunk = match self.lookahead.take() {
                Some(chunk) => chunk,
                None => {
                    if !self.source.has_next_chunk() {
                        debug!("End of result after {} rows", self.rows_returned);
                        return Ok(false);
                    }
                    self.source.next_chunk().await?
                }
            };

            self.cursor = BatchRowCursor::new();
            if self.cursor.next_row(chunk.set()) {
                self.current = Some(chunk);
                self.rows_returned += 1;
                return Ok(true);
            }
            trace!("Skipping chunk {} with no rows", chunk.index());
        }
    }

    /// Raw value of column `column_index` in the current row.
    pub fn column_value(&self, column_index: usize) -> Result<RawValue<'_>> {
        let chunk = self
            .current
            .as_ref()
            .ok_or_else(|| Error::state("no current row; call next() first"))?;
        self.cursor.column_value(chunk.set(), column_index)
    }

    /// Index of the chunk holding the current row.
    pub fn current_chunk_index(&self) -> Option<i64> {
        self.current.as_ref().map(|chunk| chunk.index())
    }

    /// Number of rows `next` has returned so far.
    pub fn rows_returned(&self) -> u64 {
        self.rows_returned
    }

    /// Release every chunk and stop background work. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        self.lookahead = None;
        self.source.close();
        debug!("Result reader closed after {} rows", self.rows_returned);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ResultRowReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Synchronous facade over [`ResultRowReader`].
///
/// Must not be used from inside an async context of the same runtime:
/// every call blocks the current thread on `runtime_handle`.
#[derive(Debug)]
pub struct BlockingRowReader {
    inner: ResultRowReader,
    runtime_handle: Handle,
}

impl BlockingRowReader {
    pub fn new(inner: ResultRowReader, runtime_handle: Handle) -> Self {
        Self {
            inner,
            runtime_handle,
        }
    }

    pub fn schema(&self) -> Option<SchemaRef> {
        self.inner.schema()
    }

    pub fn has_next(&mut self) -> Result<bool> {
        self.runtime_handle.block_on(self.inner.has_next())
    }

    pub fn next(&mut self) -> Result<bool> {
        self.runtime_handle.block_on(self.inner.next())
    }

    pub fn column_value(&self, column_index: usize) -> Result<RawValue<'_>> {
        self.inner.column_value(column_index)
    }

    pub fn rows_returned(&self) -> u64 {
        self.inner.rows_returned()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn into_inner(self) -> ResultRowReader {
        self.inner
    }
}
