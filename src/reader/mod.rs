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

//! Result readers for fetching query results from Databricks.
//!
//! This module provides:
//! - `ResultReaderFactory`: Creates the appropriate reader for a result
//! - `ChunkScheduler`: Streams Arrow chunks via cloud storage downloads
//! - `InlineChunkAdapter`: Handles an inline Arrow attachment as one chunk
//! - `ResultRowReader` / `BlockingRowReader`: Row cursors over either source

pub mod batch_set;
pub mod chunk_store;
pub mod cloudfetch;
pub mod inline;
mod row_reader;

use crate::client::{HttpChunkFetcher, ResultLinkClient};
use crate::error::{Error, Result};
use crate::logging::{self, LogConfig};
use crate::options::ReaderOptions;
use crate::reader::batch_set::DecodedBatchSet;
use crate::reader::chunk_store::ChunkStore;
use crate::reader::cloudfetch::{
    ChunkDownloader, ChunkLinkResolver, ChunkPayloadFetcher, ChunkScheduler, LinkResolver,
};
use crate::reader::inline::InlineChunkAdapter;
use crate::types::cloudfetch::{CloudFetchConfig, CloudFetchLink};
use crate::types::manifest::{ColumnInfo, ResultData, ResultManifest};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use row_reader::{BlockingRowReader, ResultRowReader};

/// Ordered source of decoded chunks behind a row reader.
///
/// Both delivery modes implement it, so the row cursor logic is the same
/// whether chunks were downloaded or extracted from an inline attachment.
#[async_trait]
pub trait ChunkSource: Send + std::fmt::Debug {
    /// Schema known before any chunk is decoded, if any.
    fn schema(&self) -> Option<SchemaRef>;

    /// Whether another call to `next_chunk` can produce a chunk or its error.
    fn has_next_chunk(&self) -> bool;

    /// Wait for the next chunk in index order.
    async fn next_chunk(&mut self) -> Result<LoadedChunk>;

    /// Stop producing chunks and release pending work. Idempotent.
    fn close(&mut self);
}

/// A decoded chunk handed to the consumer.
///
/// Releasing frees the chunk's batches and marks its descriptor released.
/// Dropping a `LoadedChunk` releases it.
#[derive(Debug)]
pub struct LoadedChunk {
    index: i64,
    set: DecodedBatchSet,
    store: Arc<ChunkStore>,
}

impl LoadedChunk {
    pub fn new(index: i64, set: DecodedBatchSet, store: Arc<ChunkStore>) -> Self {
        Self { index, set, store }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn set(&self) -> &DecodedBatchSet {
        &self.set
    }

    pub fn num_rows(&self) -> usize {
        self.set.num_rows()
    }

    /// Free the chunk's memory. Returns `true` only on the first call.
    pub fn release(&mut self) -> bool {
        let freed = self.set.release();
        if let Err(e) = self.store.release(self.index) {
            warn!("Chunk {}: could not mark released: {}", self.index, e);
        }
        freed
    }
}

impl Drop for LoadedChunk {
    fn drop(&mut self) {
        self.release();
    }
}

/// Source for results with no rows at all.
///
/// Used for valid queries that return zero rows (e.g., `SELECT * WHERE 1=0`).
/// The schema is preserved from the query's manifest.
#[derive(Debug)]
pub struct EmptyChunkSource {
    schema: SchemaRef,
}

impl EmptyChunkSource {
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl ChunkSource for EmptyChunkSource {
    fn schema(&self) -> Option<SchemaRef> {
        Some(self.schema.clone())
    }

    fn has_next_chunk(&self) -> bool {
        false
    }

    async fn next_chunk(&mut self) -> Result<LoadedChunk> {
        Err(Error::state("empty result has no chunks"))
    }

    fn close(&mut self) {}
}

/// Factory that creates the appropriate reader for a result.
///
/// Encapsulates the decision of CloudFetch vs inline vs empty results. The
/// link RPC and the payload transport are injected, so the factory works with
/// any statement-execution backend.
#[derive(Debug)]
pub struct ResultReaderFactory {
    link_client: Arc<dyn ResultLinkClient>,
    payload_fetcher: Arc<dyn ChunkPayloadFetcher>,
    config: CloudFetchConfig,
    runtime_handle: tokio::runtime::Handle,
}

impl ResultReaderFactory {
    /// Create a new result reader factory.
    ///
    /// Installs the process-wide log subscriber from `options` on first use.
    pub fn new(
        link_client: Arc<dyn ResultLinkClient>,
        payload_fetcher: Arc<dyn ChunkPayloadFetcher>,
        options: &ReaderOptions,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        logging::init_logging(&LogConfig {
            level: options.log_level.clone(),
            file: options.log_file.clone(),
        });

        Self {
            link_client,
            payload_fetcher,
            config: options.cloudfetch.clone(),
            runtime_handle,
        }
    }

    /// Factory downloading chunks over HTTP, with the transport configured
    /// from `options.http`.
    pub fn with_http(
        link_client: Arc<dyn ResultLinkClient>,
        options: &ReaderOptions,
        runtime_handle: tokio::runtime::Handle,
    ) -> Result<Self> {
        let fetcher = Arc::new(HttpChunkFetcher::new(options.http.clone())?);
        Ok(Self::new(link_client, fetcher, options, runtime_handle))
    }

    pub fn config(&self) -> &CloudFetchConfig {
        &self.config
    }

    pub fn payload_fetcher(&self) -> &Arc<dyn ChunkPayloadFetcher> {
        &self.payload_fetcher
    }

    /// Create a reader for a succeeded statement's result.
    ///
    /// Selects CloudFetch when the result carries external links, or when the
    /// manifest lists chunks and no inline attachment is present. Otherwise an
    /// inline attachment is read as a single chunk, and a result with neither
    /// is empty.
    pub fn create_reader(
        &self,
        statement_id: &str,
        manifest: &ResultManifest,
        result: &ResultData,
    ) -> Result<ResultRowReader> {
        debug!(
            "Result manifest: total_chunks={:?}, total_rows={:?}, total_bytes={:?}",
            manifest.total_chunk_count, manifest.total_row_count, manifest.total_byte_count
        );

        let external_links = result.external_links.as_deref().unwrap_or(&[]);
        let attachment = result.attachment.as_deref().filter(|a| !a.is_empty());
        let has_chunks = manifest.chunks.as_ref().is_some_and(|c| !c.is_empty());

        // Priority 1: CloudFetch
        if !external_links.is_empty() || (has_chunks && attachment.is_none()) {
            if !self.config.enabled {
                return Err(Error::state(
                    "result is delivered through external links but CloudFetch is disabled",
                ));
            }
            info!(
                "Using CloudFetch reader: {} initial links, total_chunks={:?}",
                external_links.len(),
                manifest.total_chunk_count
            );
            let links = external_links
                .iter()
                .map(CloudFetchLink::from_external_link)
                .collect::<Result<Vec<_>>>()?;
            return self.create_cloudfetch_reader(statement_id, manifest, links);
        }

        let declared_schema = schema_from_columns(manifest.columns());

        // Priority 2: inline Arrow attachment
        if let Some(attachment) = attachment {
            info!(
                "Using inline Arrow reader: {} bytes of Arrow IPC data",
                attachment.len()
            );
            let adapter = InlineChunkAdapter::new(
                attachment.to_vec(),
                manifest.compression(),
                declared_schema,
                manifest.total_row_count,
            );
            return Ok(ResultRowReader::new(Box::new(adapter)));
        }

        info!("Using empty reader: no result data present");
        let schema = declared_schema.unwrap_or_else(|| Arc::new(Schema::empty()));
        Ok(ResultRowReader::new(Box::new(EmptyChunkSource::new(schema))))
    }

    /// Same as [`create_reader`](Self::create_reader), wrapped for synchronous callers.
    pub fn create_blocking_reader(
        &self,
        statement_id: &str,
        manifest: &ResultManifest,
        result: &ResultData,
    ) -> Result<BlockingRowReader> {
        let reader = self.create_reader(statement_id, manifest, result)?;
        Ok(BlockingRowReader::new(reader, self.runtime_handle.clone()))
    }

    fn create_cloudfetch_reader(
        &self,
        statement_id: &str,
        manifest: &ResultManifest,
        initial_links: Vec<CloudFetchLink>,
    ) -> Result<ResultRowReader> {
        let chunks = manifest.chunks.as_deref().ok_or_else(|| {
            Error::InvalidManifest("CloudFetch result without a chunk list".to_string())
        })?;
        if let Some(total) = manifest.total_chunk_count {
            if total != chunks.len() as i64 {
                return Err(Error::InvalidManifest(format!(
                    "manifest declares {} chunks but lists {}",
                    total,
                    chunks.len()
                )));
            }
        }

        let compression = manifest.compression();
        let store = Arc::new(ChunkStore::from_chunk_infos(chunks, compression)?);

        // The resolver and the pipeline tasks pick this span up as their parent
        let span = logging::result_span(statement_id, store.total_chunks());
        let _entered = span.enter();

        debug!(
            "Creating CloudFetch reader: {} chunks, {} initial links, compression={:?}, max_concurrent_downloads={}",
            store.total_chunks(),
            initial_links.len(),
            compression,
            self.config.max_concurrent_downloads
        );

        let resolver: Arc<dyn ChunkLinkResolver> = Arc::new(LinkResolver::new(
            Arc::clone(&self.link_client),
            statement_id,
            Arc::clone(&store),
            &initial_links,
            self.runtime_handle.clone(),
        ));

        let downloader = ChunkDownloader::new(
            Arc::clone(&self.payload_fetcher),
            compression,
            self.config.speed_threshold_mbps,
        );

        let scheduler = ChunkScheduler::start(
            store,
            resolver,
            downloader,
            &self.config,
            schema_from_columns(manifest.columns()),
            &self.runtime_handle,
        );

        Ok(ResultRowReader::new(Box::new(scheduler)))
    }
}

/// Build an Arrow schema from manifest column metadata.
///
/// Returns `None` when the manifest declares no columns. Columns are ordered
/// by their declared position and are nullable.
pub fn schema_from_columns(columns: &[ColumnInfo]) -> Option<SchemaRef> {
    if columns.is_empty() {
        return None;
    }

    let mut ordered: Vec<&ColumnInfo> = columns.iter().collect();
    ordered.sort_by_key(|c| c.position);

    let fields: Vec<Field> = ordered
        .iter()
        .map(|col| Field::new(&col.name, map_sql_type(&col.type_name), true))
        .collect();

    Some(Arc::new(Schema::new(fields)))
}

/// Map Databricks SQL type names to Arrow DataTypes.
pub fn map_sql_type(type_name: &str) -> DataType {
    match type_name.to_uppercase().as_str() {
        "BOOLEAN" => DataType::Boolean,
        "BYTE" | "TINYINT" => DataType::Int8,
        "SHORT" | "SMALLINT" => DataType::Int16,
        "INT" | "INTEGER" => DataType::Int32,
        "LONG" | "BIGINT" => DataType::Int64,
        "FLOAT" | "REAL" => DataType::Float32,
        "DOUBLE" => DataType::Float64,
        "STRING" => DataType::Utf8,
        "BINARY" => DataType::Binary,
        "DATE" => DataType::Date32,
        "TIMESTAMP" | "TIMESTAMP_NTZ" => DataType::Timestamp(TimeUnit::Microsecond, None),
        // Complex and unknown types arrive as strings
        _ => {
            debug!("Unknown Databricks type '{}', mapping to Utf8", type_name);
            DataType::Utf8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::cloudfetch::arrow_parser::test_util::*;
    use crate::types::cloudfetch::CloudFetchLink;
    use crate::types::manifest::{ChunkInfo, ResultSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct NoLinks {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResultLinkClient for NoLinks {
        async fn list_result_links(
            &self,
            _statement_id: &str,
            _start_chunk_index: i64,
        ) -> Result<Vec<CloudFetchLink>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[derive(Debug)]
    struct NoPayloads;

    #[async_trait]
    impl ChunkPayloadFetcher for NoPayloads {
        async fn fetch(&self, link: &CloudFetchLink) -> Result<Vec<u8>> {
            Err(Error::download(link.chunk_index, "no payloads in this test"))
        }
    }

    fn column(name: &str, type_name: &str, position: i32) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            type_name: type_name.to_string(),
            type_text: None,
            position,
        }
    }

    fn manifest(columns: Vec<ColumnInfo>, chunks: Option<Vec<ChunkInfo>>) -> ResultManifest {
        ResultManifest {
            format: Some("ARROW_STREAM".to_string()),
            schema: Some(ResultSchema {
                column_count: columns.len() as i32,
                columns,
            }),
            total_chunk_count: chunks.as_ref().map(|c| c.len() as i64),
            total_row_count: None,
            total_byte_count: None,
            chunks,
            result_compression: None,
        }
    }

    fn factory(options: &ReaderOptions) -> ResultReaderFactory {
        ResultReaderFactory::new(
            Arc::new(NoLinks::default()),
            Arc::new(NoPayloads),
            options,
            tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_with_http_applies_http_options() {
        let options = ReaderOptions::from_pairs([
            ("http.connect_timeout_ms", "2500"),
            ("http.read_timeout_ms", "90000"),
        ])
        .unwrap();

        let factory = ResultReaderFactory::with_http(
            Arc::new(NoLinks::default()),
            &options,
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        let fetcher = format!("{:?}", factory.payload_fetcher());
        assert!(fetcher.contains("HttpChunkFetcher"));
        assert!(fetcher.contains("connect_timeout: 2.5s"));
        assert!(fetcher.contains("read_timeout: 90s"));
    }

    #[test]
    fn test_map_sql_type() {
        assert_eq!(map_sql_type("int"), DataType::Int32);
        assert_eq!(map_sql_type("BIGINT"), DataType::Int64);
        assert_eq!(map_sql_type("STRING"), DataType::Utf8);
        assert_eq!(
            map_sql_type("TIMESTAMP"),
            DataType::Timestamp(TimeUnit::Microsecond, None)
        );
        assert_eq!(map_sql_type("ARRAY<INT>"), DataType::Utf8);
    }

    #[test]
    fn test_schema_from_columns_orders_by_position() {
        let schema = schema_from_columns(&[column("name", "STRING", 1), column("id", "INT", 0)])
            .unwrap();
        assert_eq!(schema.field(0).name(), "id");
        assert_eq!(schema.field(1).name(), "name");
        assert!(schema.field(0).is_nullable());

        assert!(schema_from_columns(&[]).is_none());
    }

    #[tokio::test]
    async fn test_empty_result_keeps_manifest_schema() {
        let factory = factory(&ReaderOptions::default());
        let manifest = manifest(vec![column("id", "INT", 0)], None);

        let mut reader = factory
            .create_reader("stmt", &manifest, &ResultData::default())
            .unwrap();

        assert!(!reader.has_next().await.unwrap());
        assert!(!reader.next().await.unwrap());
        assert_eq!(reader.schema().unwrap().field(0).name(), "id");
    }

    #[tokio::test]
    async fn test_inline_attachment_selects_inline_reader() {
        let factory = factory(&ReaderOptions::default());
        let manifest = manifest(vec![column("id", "INT", 0), column("name", "STRING", 1)], None);
        let result = ResultData {
            external_links: None,
            attachment: Some(create_test_arrow_ipc(&[create_test_batch(0, 3)])),
        };

        let mut reader = factory.create_reader("stmt", &manifest, &result).unwrap();
        let mut rows = 0;
        while reader.next().await.unwrap() {
            rows += 1;
        }
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_disabled_cloudfetch_is_refused() {
        let mut options = ReaderOptions::default();
        options.cloudfetch.enabled = false;
        let factory = factory(&options);
        let chunks = vec![ChunkInfo {
            chunk_index: 0,
            row_offset: 0,
            row_count: 5,
            byte_count: 100,
        }];
        let manifest = manifest(vec![column("id", "INT", 0)], Some(chunks));

        let result = factory.create_reader("stmt", &manifest, &ResultData::default());
        assert!(matches!(result, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn test_chunk_count_mismatch_is_invalid_manifest() {
        let factory = factory(&ReaderOptions::default());
        let chunks = vec![ChunkInfo {
            chunk_index: 0,
            row_offset: 0,
            row_count: 5,
            byte_count: 100,
        }];
        let mut manifest = manifest(vec![column("id", "INT", 0)], Some(chunks));
        manifest.total_chunk_count = Some(3);

        let result = factory.create_reader("stmt", &manifest, &ResultData::default());
        assert!(matches!(result, Err(Error::InvalidManifest(_))));
    }
}
