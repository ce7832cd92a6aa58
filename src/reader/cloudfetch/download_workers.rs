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

//! Download workers for the CloudFetch pipeline.
//!
//! Workers are long-lived tokio tasks that pull [`ChunkDownloadTask`]s from the
//! download channel, run them through a [`RetryingDownloader`] and send the
//! outcome through the task's oneshot channel.
//!
//! ## Retry Behavior
//!
//! Each chunk gets at most `max_retries` attempts. Before every attempt the
//! worker checks the chunk's link and asks the [`ChunkLinkResolver`] for a
//! fresh one if it is missing or inside the expiry buffer. A link refused by
//! storage (HTTP 401/403/404) is replaced through
//! [`ChunkLinkResolver::refresh`] and retried without the delay.
//!
//! | Error | Retried | Chunk state afterwards |
//! |---|---|---|
//! | Link rejected by storage | Yes, immediately with a refreshed link | `DownloadRetry`, `UrlFetched` once refreshed |
//! | Network / HTTP / decode | Yes, after `retry_delay` | `DownloadRetry`, then `DownloadFailed` once attempts run out |
//! | Link batch RPC failure | Yes, after `retry_delay` | unchanged, then `DownloadFailed` |
//! | Resolver shut down, out of range, state error | No | `DownloadFailed` |
//! | Cancellation (any time, including the delay) | No | `Cancelled` |

use crate::error::{Error, Result};
use crate::logging;
use crate::reader::batch_set::DecodedBatchSet;
use crate::reader::chunk_store::{ChunkStatus, ChunkStore};
use crate::reader::cloudfetch::chunk_downloader::ChunkDownloader;
use crate::reader::cloudfetch::link_resolver::ChunkLinkResolver;
use crate::reader::cloudfetch::pipeline_types::ChunkDownloadTask;
use crate::types::cloudfetch::{CloudFetchConfig, CloudFetchLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument};

/// Downloads one chunk with a bounded, fixed-delay retry policy.
#[derive(Debug)]
pub struct RetryingDownloader {
    store: Arc<ChunkStore>,
    resolver: Arc<dyn ChunkLinkResolver>,
    downloader: ChunkDownloader,
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryingDownloader {
    pub fn new(
        store: Arc<ChunkStore>,
        resolver: Arc<dyn ChunkLinkResolver>,
        downloader: ChunkDownloader,
        config: &CloudFetchConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            downloader,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// Download and decode `chunk_index`, retrying transient failures.
    ///
    /// On success the chunk is `DownloadSucceeded`. When attempts run out the
    /// chunk is `DownloadFailed` and the error names the chunk. Cancellation
    /// is never retried and comes back as `Error::Cancelled`.
    pub async fn download(
        &self,
        chunk_index: i64,
        cancel_token: &CancellationToken,
    ) -> Result<DecodedBatchSet> {
        let expected_rows = self.store.descriptor(chunk_index)?.row_count;
        let mut attempt: u32 = 0;
        let mut link_rejected = false;

        loop {
            attempt += 1;
            if cancel_token.is_cancelled() {
                return Err(self.cancel(chunk_index));
            }

            let outcome = tokio::select! {
                _ = cancel_token.cancelled() => return Err(self.cancel(chunk_index)),
                outcome = self.attempt(chunk_index, expected_rows, link_rejected) => outcome,
            };

            let e = match outcome {
                Ok(set) => {
                    self.store
                        .transition(chunk_index, ChunkStatus::DownloadSucceeded)?;
                    trace!(
                        "Chunk {} downloaded on attempt {}/{} ({} rows)",
                        chunk_index,
                        attempt,
                        self.max_retries,
                        set.num_rows()
                    );
                    return Ok(set);
                }
                Err(e) => e,
            };

            if e.is_cancelled() {
                return Err(self.cancel(chunk_index));
            }

            if !e.is_retryable() || attempt >= self.max_retries {
                return Err(self.give_up(chunk_index, attempt, e));
            }

            if self.store.status(chunk_index)? == ChunkStatus::DownloadInProgress {
                self.store
                    .transition(chunk_index, ChunkStatus::DownloadRetry)?;
            }

            link_rejected = e.is_link_rejected();
            if link_rejected {
                warn!(
                    "Chunk {}: attempt {}/{} failed: {}, refreshing link",
                    chunk_index, attempt, self.max_retries, e
                );
                continue;
            }

            warn!(
                "Chunk {}: attempt {}/{} failed: {}, retrying in {:?}",
                chunk_index, attempt, self.max_retries, e, self.retry_delay
            );

            tokio::select! {
                _ = cancel_token.cancelled() => return Err(self.cancel(chunk_index)),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// One attempt: make sure a usable link is installed, then fetch and decode.
    async fn attempt(
        &self,
        chunk_index: i64,
        expected_rows: i64,
        link_rejected: bool,
    ) -> Result<DecodedBatchSet> {
        let link = self.usable_link(chunk_index, link_rejected).await?;
        self.store
            .transition(chunk_index, ChunkStatus::DownloadInProgress)?;
        self.downloader.download(&link, expected_rows).await
    }

    /// The stored link if it is still good. Otherwise, or when storage just
    /// rejected it, a fresh one from the resolver.
    async fn usable_link(&self, chunk_index: i64, link_rejected: bool) -> Result<CloudFetchLink> {
        let current = self.store.link(chunk_index);
        let link = match current {
            Some(stale) if link_rejected => {
                debug!("Chunk {}: link rejected, refreshing", chunk_index);
                self.resolver.refresh(chunk_index, &stale.url).await?
            }
            Some(link) if !link.is_expired() => return Ok(link),
            Some(_) => {
                debug!(
                    "Chunk {}: link expired or expiring soon, resolving a fresh one",
                    chunk_index
                );
                self.resolver.resolve(chunk_index).await?
            }
            None => self.resolver.resolve(chunk_index).await?,
        };

        // Pending moves to UrlFetched; UrlFetched and DownloadRetry get the new link
        self.store.set_link(chunk_index, link.clone())?;
        if self.store.status(chunk_index)? == ChunkStatus::DownloadRetry {
            self.store.transition(chunk_index, ChunkStatus::UrlFetched)?;
        }
        Ok(link)
    }

    fn cancel(&self, chunk_index: i64) -> Error {
        if let Ok(status) = self.store.status(chunk_index) {
            if !status.is_terminal() {
                let _ = self.store.transition(chunk_index, ChunkStatus::Cancelled);
            }
        }
        debug!("Chunk {}: download cancelled", chunk_index);
        Error::cancelled(format!("download of chunk {} cancelled", chunk_index))
    }

    fn give_up(&self, chunk_index: i64, attempts: u32, e: Error) -> Error {
        error!(
            "Chunk {}: download failed after {} attempt(s): {}",
            chunk_index, attempts, e
        );
        let message = e.to_string();
        if let Err(state_err) = self
            .store
            .fail(chunk_index, ChunkStatus::DownloadFailed, &message)
        {
            warn!("Chunk {}: could not record failure: {}", chunk_index, state_err);
        }

        if e.is_retryable() {
            Error::download(
                chunk_index,
                format!("failed after {} attempts: {}", attempts, message),
            )
        } else {
            e
        }
    }
}

/// Spawns `num_workers` download workers on `runtime_handle`.
///
/// Workers share the download channel and run until it closes or
/// `cancel_token` fires.
pub fn spawn_download_workers(
    num_workers: usize,
    download_rx: mpsc::UnboundedReceiver<ChunkDownloadTask>,
    downloader: Arc<RetryingDownloader>,
    cancel_token: CancellationToken,
    runtime_handle: &tokio::runtime::Handle,
) -> Vec<JoinHandle<()>> {
    let download_rx = Arc::new(tokio::sync::Mutex::new(download_rx));

    debug!(
        "Spawning {} download workers (max_retries={}, retry_delay={:?})",
        num_workers, downloader.max_retries, downloader.retry_delay
    );

    (0..num_workers)
        .map(|worker_id| {
            let rx = Arc::clone(&download_rx);
            let dl = Arc::clone(&downloader);
            let token = cancel_token.clone();
            runtime_handle.spawn(worker_task(worker_id, rx, dl, token).in_current_span())
        })
        .collect()
}

async fn worker_task(
    worker_id: usize,
    download_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ChunkDownloadTask>>>,
    downloader: Arc<RetryingDownloader>,
    cancel_token: CancellationToken,
) {
    debug!("Worker {} started", worker_id);

    loop {
        let task = {
            let mut rx = download_rx.lock().await;
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker {} cancelled while waiting for task", worker_id);
                    return;
                }
                task = rx.recv() => task
            }
        };

        let Some(task) = task else {
            debug!("Worker {} exiting: download channel closed", worker_id);
            break;
        };

        trace!("Worker {} received chunk {}", worker_id, task.chunk_index);

        let result = downloader
            .download(task.chunk_index, &cancel_token)
            .instrument(logging::chunk_span(task.chunk_index))
            .await;

        // The consumer may have gone away; free what was decoded for nobody
        if let Err(Ok(mut set)) = task.result_tx.send(result) {
            debug!(
                "Worker {}: result receiver dropped for chunk {}",
                worker_id, task.chunk_index
            );
            set.release();
        }
    }

    debug!("Worker {} exiting", worker_id);
}
