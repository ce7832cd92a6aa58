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

use crate::error::{Error, Result};
use crate::reader::batch_set::DecodedBatchSet;
use crate::reader::chunk_store::{ChunkStatus, ChunkStore};
use crate::reader::cloudfetch::arrow_parser::{decode_chunk, decompress};
use crate::reader::{ChunkSource, LoadedChunk};
use crate::types::manifest::CompressionCodec;
use arrow_ipc::writer::StreamWriter;
use arrow_ipc::MessageHeader;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};

const CONTINUATION_MARKER: [u8; 4] = [0xFF; 4];
const END_OF_STREAM: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];

/// Presents an inline Arrow attachment as a single-chunk [`ChunkSource`].
///
/// The attachment is decoded lazily on the first `next_chunk` call, through
/// the same decoder as downloaded chunks. When the attachment carries only
/// record batches, the schema declared by the manifest is serialized in
/// front of them so the payload reads as one complete IPC stream.
#[derive(Debug)]
pub struct InlineChunkAdapter {
    payload: Option<Vec<u8>>,
    compression: CompressionCodec,
    declared_schema: Option<SchemaRef>,
    store: Arc<ChunkStore>,
    consumed: bool,
    closed: bool,
}

impl InlineChunkAdapter {
    /// `declared_rows` is the manifest's row count for the result, when known;
    /// a decoded attachment with a different row count is rejected.
    pub fn new(
        attachment: Vec<u8>,
        compression: CompressionCodec,
        declared_schema: Option<SchemaRef>,
        declared_rows: Option<i64>,
    ) -> Self {
        debug!(
            "Inline result: {} bytes, compression={:?}, declared_rows={:?}",
            attachment.len(),
            compression,
            declared_rows
        );

        Self {
            payload: Some(attachment),
            compression,
            declared_schema,
            store: Arc::new(ChunkStore::single_inline(declared_rows, compression)),
            consumed: false,
            closed: false,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    fn extract(&self, payload: &[u8]) -> Result<DecodedBatchSet> {
        let bytes = decompress(payload, self.compression)?;
        let stream = complete_stream(&bytes, self.declared_schema.as_ref())?;
        let mut set = decode_chunk(&stream)?;

        let expected_rows = self.store.descriptor(0)?.row_count;
        if expected_rows >= 0 && set.num_rows() as i64 != expected_rows {
            let decoded = set.num_rows();
            set.release();
            return Err(Error::decode(format!(
                "inline result decoded {} rows, manifest declares {}",
                decoded, expected_rows
            )));
        }
        Ok(set)
    }
}

#[async_trait]
impl ChunkSource for InlineChunkAdapter {
    fn schema(&self) -> Option<SchemaRef> {
        self.declared_schema.clone()
    }

    fn has_next_chunk(&self) -> bool {
        !self.closed && !self.consumed
    }

    async fn next_chunk(&mut self) -> Result<LoadedChunk> {
        if self.closed {
            return Err(Error::state("result reader is closed"));
        }
        if self.consumed {
            return Err(Error::state("inline result has a single chunk"));
        }
        self.consumed = true;

        let payload = self.payload.take().unwrap_or_default();
        match self.extract(&payload) {
            Ok(set) => {
                self.store.transition(0, ChunkStatus::ExtractSucceeded)?;
                debug!(
                    "Inline chunk decoded: {} batches, {} rows, {} bytes",
                    set.batches().len(),
                    set.num_rows(),
                    set.memory_size()
                );
                Ok(LoadedChunk::new(0, set, Arc::clone(&self.store)))
            }
            Err(e) => {
                if let Err(state_err) =
                    self.store
                        .fail(0, ChunkStatus::ExtractFailed, &e.to_string())
                {
                    warn!("Inline chunk: could not record failure: {}", state_err);
                }
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.payload = None;
        self.store.cancel_outstanding();
    }
}

/// Turn an inline payload into a complete IPC stream: schema message first,
/// end-of-stream marker last.
fn complete_stream<'a>(bytes: &'a [u8], schema: Option<&SchemaRef>) -> Result<Cow<'a, [u8]>> {
    let has_schema = starts_with_schema_message(bytes);
    let has_eos = bytes.ends_with(&END_OF_STREAM);
    if has_schema && has_eos {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut stream = if has_schema {
        Vec::with_capacity(bytes.len() + END_OF_STREAM.len())
    } else {
        let schema = schema.ok_or_else(|| {
            Error::decode("inline attachment has no schema message and no columns are declared")
        })?;
        let mut prefix = schema_message(schema)?;
        prefix.reserve(bytes.len() + END_OF_STREAM.len());
        prefix
    };

    stream.extend_from_slice(bytes);
    if !has_eos {
        stream.extend_from_slice(&END_OF_STREAM);
    }
    Ok(Cow::Owned(stream))
}

/// Serialized IPC schema message for `schema`, without end-of-stream marker.
fn schema_message(schema: &SchemaRef) -> Result<Vec<u8>> {
    let mut writer = StreamWriter::try_new(Vec::new(), schema)
        .map_err(|e| Error::decode(format!("failed to serialize schema: {}", e)))?;
    writer
        .finish()
        .map_err(|e| Error::decode(format!("failed to serialize schema: {}", e)))?;
    let mut bytes = writer
        .into_inner()
        .map_err(|e| Error::decode(format!("failed to serialize schema: {}", e)))?;

    if bytes.ends_with(&END_OF_STREAM) {
        bytes.truncate(bytes.len() - END_OF_STREAM.len());
    }
    Ok(bytes)
}

/// Whether the first IPC message in `bytes` is a schema message.
fn starts_with_schema_message(bytes: &[u8]) -> bool {
    let (length_at, metadata_at) = if bytes.starts_with(&CONTINUATION_MARKER) {
        (4, 8)
    } else {
        // Pre-1.0 streams have no continuation marker
        (0, 4)
    };

    let Some(length_bytes) = bytes.get(length_at..metadata_at) else {
        return false;
    };
    let mut length = [0u8; 4];
    length.copy_from_slice(length_bytes);
    let metadata_len = i32::from_le_bytes(length);
    if metadata_len <= 0 {
        return false;
    }

    let Some(metadata) = bytes.get(metadata_at..metadata_at + metadata_len as usize) else {
        return false;
    };
    arrow_ipc::root_as_message(metadata)
        .map(|message| message.header_type() == MessageHeader::Schema)
        .unwrap_or(false)
}
