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

//! Arrow IPC parsing utilities for chunk payloads.
//!
//! Chunk payloads are Arrow IPC Streaming format bytes: a schema message
//! followed by record batch messages, optionally LZ4 frame compressed. The
//! same parser serves CloudFetch downloads and inline attachments.

use crate::error::{Error, Result};
use crate::reader::batch_set::DecodedBatchSet;
use crate::types::manifest::CompressionCodec;
use arrow_ipc::reader::StreamReader;
use lz4_flex::frame::FrameDecoder;
use std::borrow::Cow;
use std::io::{Cursor, Read};
use tracing::trace;

/// Decompress a chunk payload according to the manifest's codec.
pub fn decompress(data: &[u8], compression: CompressionCodec) -> Result<Cow<'_, [u8]>> {
    match compression {
        CompressionCodec::Lz4Frame => {
            let mut decoder = FrameDecoder::new(Cursor::new(data));
            let mut buf = Vec::new();
            decoder
                .read_to_end(&mut buf)
                .map_err(|e| Error::decode(format!("LZ4 decompression failed: {}", e)))?;
            Ok(Cow::Owned(buf))
        }
        CompressionCodec::None => Ok(Cow::Borrowed(data)),
    }
}

/// Decode an uncompressed Arrow IPC stream into a [`DecodedBatchSet`].
///
/// Every batch owns its buffers once it leaves the reader, so the reader and
/// the input bytes can be dropped independently of the returned set. If the
/// stream breaks off mid-way, the batches decoded so far are released before
/// the error is returned.
pub fn decode_chunk(bytes: &[u8]) -> Result<DecodedBatchSet> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| Error::decode(format!("Failed to create Arrow IPC reader: {}", e)))?;

    let mut set = DecodedBatchSet::new(reader.schema());
    for batch in reader {
        let pushed = batch
            .map_err(|e| Error::decode(format!("Failed to read Arrow batches: {}", e)))
            .and_then(|batch| set.push(batch));

        if let Err(e) = pushed {
            set.release();
            return Err(e);
        }
    }

    trace!(
        "Decoded {} batches, {} rows, {} bytes",
        set.batches().len(),
        set.num_rows(),
        set.memory_size()
    );
    Ok(set)
}

/// Decompress then decode a chunk payload.
pub fn parse_arrow_ipc(data: &[u8], compression: CompressionCodec) -> Result<DecodedBatchSet> {
    let bytes = decompress(data, compression)?;
    decode_chunk(&bytes)
}
