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

//! Scheduler for the CloudFetch download pipeline.
//!
//! The scheduler walks chunk indices `0..total_chunks` in ascending order and
//! creates a oneshot channel pair for each. It sends the [`ChunkHandle`] to the
//! result channel first (preserving ordering) and then sends the
//! [`ChunkDownloadTask`] to the download channel. Link resolution happens in
//! the workers, so the scheduler never waits on the link RPC.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! [Scheduler] --> download_channel --> [Download Workers] <--> [LinkResolver]
//!      |
//!      +--> result_channel --> [ChunkScheduler::next_chunk] --> [Row reader]
//! ```
//!
//! ## Backpressure
//!
//! The bounded `result_channel` holds at most `max_concurrent_downloads`
//! handles. When it is full the scheduler blocks on the send until the
//! consumer takes a handle, so in-flight plus unconsumed chunks stay bounded
//! by the pool size (plus the chunk the consumer is reading).
//!
//! ## Ordering Invariant
//!
//! The scheduler always sends `ChunkHandle` to `result_channel` BEFORE sending
//! `ChunkDownloadTask` to `download_channel`. This ensures that:
//! 1. The consumer receives handles in chunk-index order
//! 2. Even if downloads complete out of order, results are consumed in order

use crate::error::{Error, Result};
use crate::reader::chunk_store::ChunkStore;
use crate::reader::cloudfetch::chunk_downloader::ChunkDownloader;
use crate::reader::cloudfetch::download_workers::{spawn_download_workers, RetryingDownloader};
use crate::reader::cloudfetch::link_resolver::ChunkLinkResolver;
use crate::reader::cloudfetch::pipeline_types::{
    create_chunk_pair, ChunkDownloadTask, ChunkHandle,
};
use crate::reader::{ChunkSource, LoadedChunk};
use crate::types::cloudfetch::CloudFetchConfig;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};

/// Channels returned by the scheduler for consumption by other pipeline components.
///
/// - `download_rx`: Download workers pull `ChunkDownloadTask` from this channel
/// - `result_rx`: Consumer pulls `ChunkHandle` from this channel in chunk-index order
pub struct SchedulerChannels {
    /// Receiver for download tasks. Download workers should pull from this.
    pub download_rx: mpsc::UnboundedReceiver<ChunkDownloadTask>,
    /// Receiver for chunk handles. Consumer should pull from this in order.
    pub result_rx: mpsc::Receiver<ChunkHandle>,
    /// Handle to the scheduler task for lifecycle management.
    pub scheduler_handle: JoinHandle<()>,
}

/// Spawns the scheduler task for `total_chunks` chunks and returns the pipeline channels.
///
/// The scheduler task runs until either:
/// - Every chunk index has been enqueued
/// - The cancellation token is triggered
/// - The consumer or the workers went away
pub fn spawn_scheduler(
    total_chunks: i64,
    config: &CloudFetchConfig,
    cancel_token: CancellationToken,
    runtime_handle: &Handle,
) -> SchedulerChannels {
    // download_channel is unbounded - backpressure comes from result_channel
    let (download_tx, download_rx) = mpsc::unbounded_channel::<ChunkDownloadTask>();

    let capacity = config.max_concurrent_downloads.max(1);
    let (result_tx, result_rx) = mpsc::channel::<ChunkHandle>(capacity);

    debug!(
        "Spawning scheduler for {} chunks with capacity={}",
        total_chunks, capacity
    );

    let scheduler_handle = runtime_handle.spawn(
        scheduler_task(total_chunks, download_tx, result_tx, cancel_token).in_current_span(),
    );

    SchedulerChannels {
        download_rx,
        result_rx,
        scheduler_handle,
    }
}

async fn scheduler_task(
    total_chunks: i64,
    download_tx: mpsc::UnboundedSender<ChunkDownloadTask>,
    result_tx: mpsc::Sender<ChunkHandle>,
    cancel_token: CancellationToken,
) {
    debug!("Scheduler task started");

    for chunk_index in 0..total_chunks {
        if cancel_token.is_cancelled() {
            debug!("Scheduler cancelled before chunk {}", chunk_index);
            return;
        }

        let (task, handle) = create_chunk_pair(chunk_index);

        // Handle first: the consumer must see handles in index order.
        // Blocks while the result channel is full.
        let send_result = tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Scheduler cancelled while sending handle for chunk {}", chunk_index);
                return;
            }
            result = result_tx.send(handle) => result
        };

        if send_result.is_err() {
            debug!(
                "Scheduler: result channel closed, stopping at chunk {}",
                chunk_index
            );
            return;
        }

        if download_tx.send(task).is_err() {
            debug!(
                "Scheduler: download channel closed, stopping at chunk {}",
                chunk_index
            );
            return;
        }

        trace!(
            "Scheduler: enqueued chunk {} (handle first, then task)",
            chunk_index
        );
    }

    debug!("Scheduler task completed: {} chunks enqueued", total_chunks);
    // Dropping the senders ends the stream for workers and consumer
}

/// Ordered source of downloaded chunks for a link-based result.
///
/// Owns the whole download pipeline of one result: the scheduler task, the
/// worker pool and the link resolver. `next_chunk` hands chunks out in strict
/// index order; a chunk that failed terminally yields its error at its own
/// position and the chunks after it stay readable.
#[derive(Debug)]
pub struct ChunkScheduler {
    store: Arc<ChunkStore>,
    resolver: Arc<dyn ChunkLinkResolver>,
    schema: Option<SchemaRef>,
    result_rx: mpsc::Receiver<ChunkHandle>,
    cancel_token: CancellationToken,
    scheduler_handle: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    next_index: i64,
    total_chunks: i64,
    closed: bool,
}

impl ChunkScheduler {
    /// Start the scheduler and `max_concurrent_downloads` workers on `runtime_handle`.
    ///
    /// `schema` is the schema declared by the manifest, if any; it is only
    /// reported back through [`ChunkSource::schema`].
    pub fn start(
        store: Arc<ChunkStore>,
        resolver: Arc<dyn ChunkLinkResolver>,
        downloader: ChunkDownloader,
        config: &CloudFetchConfig,
        schema: Option<SchemaRef>,
        runtime_handle: &Handle,
    ) -> Self {
        let total_chunks = store.total_chunks();
        let cancel_token = CancellationToken::new();

        let channels = spawn_scheduler(total_chunks, config, cancel_token.clone(), runtime_handle);

        let retrying = Arc::new(RetryingDownloader::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            downloader,
            config,
        ));
        let workers = spawn_download_workers(
            config.max_concurrent_downloads.max(1),
            channels.download_rx,
            retrying,
            cancel_token.clone(),
            runtime_handle,
        );

        debug!(
            "CloudFetch pipeline started: {} chunks, {} rows, {} workers",
            total_chunks,
            store.total_row_count(),
            workers.len()
        );

        Self {
            store,
            resolver,
            schema,
            result_rx: channels.result_rx,
            cancel_token,
            scheduler_handle: channels.scheduler_handle,
            workers,
            next_index: 0,
            total_chunks,
            closed: false,
        }
    }

    /// Index of the chunk the next `next_chunk` call returns.
    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }
}

#[async_trait]
impl ChunkSource for ChunkScheduler {
    fn schema(&self) -> Option<SchemaRef> {
        self.schema.clone()
    }

    fn has_next_chunk(&self) -> bool {
        !self.closed && self.next_index < self.total_chunks
    }

    async fn next_chunk(&mut self) -> Result<LoadedChunk> {
        if self.closed {
            return Err(Error::state("result reader is closed"));
        }
        if self.next_index >= self.total_chunks {
            return Err(Error::state(format!(
                "all {} chunks have been consumed",
                self.total_chunks
            )));
        }

        let handle = tokio::select! {
            _ = self.cancel_token.cancelled() => {
                return Err(Error::cancelled("chunk pipeline cancelled"));
            }
            handle = self.result_rx.recv() => handle.ok_or_else(|| {
                Error::cancelled(format!(
                    "chunk pipeline stopped before chunk {}",
                    self.next_index
                ))
            })?,
        };

        if handle.chunk_index != self.next_index {
            return Err(Error::state(format!(
                "expected chunk {}, scheduler produced chunk {}",
                self.next_index, handle.chunk_index
            )));
        }

        let chunk_index = handle.chunk_index;
        self.next_index += 1;

        trace!("Waiting for chunk {}", chunk_index);
        let set = handle.wait().await?;

        Ok(LoadedChunk::new(chunk_index, set, Arc::clone(&self.store)))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.cancel_token.cancel();
        self.resolver.shutdown();
        self.result_rx.close();
        self.scheduler_handle.abort();
        for worker in &self.workers {
            worker.abort();
        }

        // Queued handles own decoded chunks nobody will read; free them now
        let mut drained = 0;
        while let Ok(handle) = self.result_rx.try_recv() {
            drop(handle);
            drained += 1;
        }

        let cancelled = self.store.cancel_outstanding();
        debug!(
            "CloudFetch pipeline closed at chunk {}/{} ({} chunks cancelled, {} queued handles dropped)",
            self.next_index, self.total_chunks, cancelled, drained
        );
    }
}

impl Drop for ChunkScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkResolutionError;
    use crate::reader::chunk_store::ChunkStatus;
    use crate::reader::cloudfetch::arrow_parser::test_util::*;
    use crate::reader::cloudfetch::chunk_downloader::ChunkPayloadFetcher;
    use crate::types::cloudfetch::CloudFetchLink;
    use crate::types::manifest::{ChunkInfo, CompressionCodec};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const ROWS_PER_CHUNK: i64 = 10;

    fn create_test_link(chunk_index: i64) -> CloudFetchLink {
        CloudFetchLink {
            url: format!("https://storage.example.com/chunk{}", chunk_index),
            chunk_index,
            row_offset: chunk_index * ROWS_PER_CHUNK,
            row_count: ROWS_PER_CHUNK,
            byte_count: 1000,
            expiration: chrono::Utc::now() + chrono::Duration::hours(1),
            http_headers: HashMap::new(),
        }
    }

    fn create_store(total_chunks: i64) -> Arc<ChunkStore> {
        let infos: Vec<ChunkInfo> = (0..total_chunks)
            .map(|i| ChunkInfo {
                chunk_index: i,
                row_offset: i * ROWS_PER_CHUNK,
                row_count: ROWS_PER_CHUNK,
                byte_count: 1000,
            })
            .collect();
        Arc::new(ChunkStore::from_chunk_infos(&infos, CompressionCodec::None).unwrap())
    }

    /// Resolver handing out a fresh link for any index.
    #[derive(Debug, Default)]
    struct MockResolver {
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl ChunkLinkResolver for MockResolver {
        async fn resolve(&self, chunk_index: i64) -> Result<CloudFetchLink> {
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(LinkResolutionError::Shutdown.into());
            }
            Ok(create_test_link(chunk_index))
        }

        fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    /// Fetcher serving `ROWS_PER_CHUNK` rows per chunk. Chunks in `slow`
    /// take 100ms, chunks in `broken` always fail, and `blocked` never completes.
    #[derive(Debug, Default)]
    struct MockFetcher {
        slow: HashSet<i64>,
        broken: HashSet<i64>,
        blocked: bool,
        fetch_count: AtomicUsize,
    }

    #[async_trait]
    impl ChunkPayloadFetcher for MockFetcher {
        async fn fetch(&self, link: &CloudFetchLink) -> Result<Vec<u8>> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            if self.blocked {
                std::future::pending::<()>().await;
            }
            if self.slow.contains(&link.chunk_index) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if self.broken.contains(&link.chunk_index) {
                return Err(Error::download(link.chunk_index, "HTTP 500 - Internal Error"));
            }
            let start = (link.chunk_index * ROWS_PER_CHUNK) as i32;
            Ok(create_test_arrow_ipc(&[create_test_batch(
                start,
                ROWS_PER_CHUNK as usize,
            )]))
        }
    }

    fn test_config(max_concurrent_downloads: usize) -> CloudFetchConfig {
        CloudFetchConfig {
            max_concurrent_downloads,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn start_scheduler(
        total_chunks: i64,
        fetcher: Arc<MockFetcher>,
        config: &CloudFetchConfig,
    ) -> ChunkScheduler {
        let store = create_store(total_chunks);
        let downloader = ChunkDownloader::new(fetcher, CompressionCodec::None, 0.0);
        ChunkScheduler::start(
            store,
            Arc::new(MockResolver::default()),
            downloader,
            config,
            None,
            &Handle::current(),
        )
    }

    #[tokio::test]
    async fn scheduler_sends_handles_in_chunk_index_order() {
        let config = CloudFetchConfig::default();
        let mut channels = spawn_scheduler(5, &config, CancellationToken::new(), &Handle::current());

        for expected_index in 0..5 {
            let handle = channels
                .result_rx
                .recv()
                .await
                .expect("Should receive handle");
            assert_eq!(handle.chunk_index, expected_index);
        }

        assert!(channels.result_rx.recv().await.is_none());

        let mut tasks = Vec::new();
        while let Ok(task) = channels.download_rx.try_recv() {
            tasks.push(task.chunk_index);
        }
        assert_eq!(tasks, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn backpressure_blocks_scheduler_at_capacity() {
        let config = CloudFetchConfig {
            max_concurrent_downloads: 2,
            ..Default::default()
        };
        let cancel_token = CancellationToken::new();
        let mut channels = spawn_scheduler(10, &config, cancel_token.clone(), &Handle::current());

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Two handles fill the channel; the third send blocks before its task is queued
        let mut queued = 0;
        while channels.download_rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);

        let _handle0 = channels.result_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channels.download_rx.try_recv().is_ok());

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn scheduler_exits_after_last_chunk() {
        let config = CloudFetchConfig::default();
        let mut channels = spawn_scheduler(2, &config, CancellationToken::new(), &Handle::current());

        let mut count = 0;
        while channels.result_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);

        let result = timeout(Duration::from_millis(100), channels.scheduler_handle).await;
        assert!(result.is_ok(), "Scheduler should exit after enqueueing all chunks");
    }

    #[tokio::test]
    async fn scheduler_cancellation_while_blocked() {
        let config = CloudFetchConfig {
            max_concurrent_downloads: 1,
            ..Default::default()
        };
        let cancel_token = CancellationToken::new();
        let channels = spawn_scheduler(10, &config, cancel_token.clone(), &Handle::current());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_token.cancel();

        let result = timeout(Duration::from_millis(500), channels.scheduler_handle).await;
        assert!(result.is_ok(), "Scheduler should exit when cancelled");
    }

    #[tokio::test]
    async fn chunks_are_returned_in_order_despite_completion_order() {
        let fetcher = Arc::new(MockFetcher {
            slow: HashSet::from([0]),
            ..Default::default()
        });
        let mut scheduler = start_scheduler(4, fetcher, &test_config(4));

        let mut seen = Vec::new();
        while scheduler.has_next_chunk() {
            let chunk = scheduler.next_chunk().await.unwrap();
            assert_eq!(chunk.num_rows(), ROWS_PER_CHUNK as usize);
            seen.push(chunk.index());
        }

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(scheduler.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn consumed_chunk_is_released_in_store() {
        let fetcher = Arc::new(MockFetcher::default());
        let mut scheduler = start_scheduler(1, fetcher, &test_config(1));

        let mut chunk = scheduler.next_chunk().await.unwrap();
        assert_eq!(
            scheduler.store().status(0).unwrap(),
            ChunkStatus::DownloadSucceeded
        );

        assert!(chunk.release());
        assert!(!chunk.release());
        assert_eq!(scheduler.store().status(0).unwrap(), ChunkStatus::Released);
    }

    #[tokio::test]
    async fn failed_chunk_surfaces_at_its_position_only() {
        let fetcher = Arc::new(MockFetcher {
            broken: HashSet::from([1]),
            ..Default::default()
        });
        let mut scheduler = start_scheduler(3, fetcher.clone(), &test_config(3));

        assert_eq!(scheduler.next_chunk().await.unwrap().index(), 0);

        let err = scheduler.next_chunk().await.unwrap_err();
        match err {
            Error::Download { chunk_index, .. } => assert_eq!(chunk_index, 1),
            other => panic!("expected download error for chunk 1, got {:?}", other),
        }
        assert_eq!(
            scheduler.store().status(1).unwrap(),
            ChunkStatus::DownloadFailed
        );

        assert_eq!(scheduler.next_chunk().await.unwrap().index(), 2);
        assert!(!scheduler.has_next_chunk());
    }

    #[tokio::test]
    async fn close_cancels_outstanding_downloads() {
        let fetcher = Arc::new(MockFetcher {
            blocked: true,
            ..Default::default()
        });
        let mut scheduler = start_scheduler(5, fetcher, &test_config(2));
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.close();
        scheduler.close();

        assert!(!scheduler.has_next_chunk());
        assert!(matches!(scheduler.next_chunk().await, Err(Error::State(_))));
        for index in 0..5 {
            assert_eq!(
                scheduler.store().status(index).unwrap(),
                ChunkStatus::Cancelled
            );
        }
    }

    #[tokio::test]
    async fn close_drops_decoded_chunks_still_queued() {
        let fetcher = Arc::new(MockFetcher::default());
        let mut scheduler = start_scheduler(3, fetcher, &test_config(4));

        timeout(Duration::from_secs(5), async {
            while (0..3).any(|index| {
                scheduler.store().status(index).unwrap() != ChunkStatus::DownloadSucceeded
            }) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all chunks should download");

        scheduler.close();

        assert!(scheduler.result_rx.try_recv().is_err());
        for index in 0..3 {
            assert_eq!(
                scheduler.store().status(index).unwrap(),
                ChunkStatus::Released
            );
        }
    }

    #[tokio::test]
    async fn pending_next_chunk_does_not_hang_on_cancel() {
        let fetcher = Arc::new(MockFetcher {
            blocked: true,
            ..Default::default()
        });
        let mut scheduler = start_scheduler(2, fetcher, &test_config(2));
        let cancel_token = scheduler.cancel_token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_token.cancel();
        });

        let result = timeout(Duration::from_secs(1), scheduler.next_chunk())
            .await
            .expect("next_chunk should return once cancelled");
        assert!(result.unwrap_err().is_cancelled());
    }
}
