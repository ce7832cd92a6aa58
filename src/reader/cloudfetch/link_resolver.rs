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

//! Presigned link resolution for CloudFetch chunks.
//!
//! The `LinkResolver` keeps one resolution slot per chunk index and fills the
//! slots from a strictly serial chain of `list_result_links` calls. The backend
//! only guarantees a contiguous run of links for a single outstanding request,
//! so at most one call is ever in flight.
//!
//! ```text
//!   next_batch_start
//!         |
//!         v
//! [R][R][R][U][U][U][U][U]      R = resolved, U = unresolved
//!          ^
//!          expired and not yet downloaded: abort the chain, replace
//!          slots 2.. with fresh ones, rewind next_batch_start to 2
//! ```
//!
//! Every read-modify-write of the slot table happens under one mutex, which
//! is never held across an await. The chain task re-checks a generation
//! counter after each RPC so results from an aborted chain are dropped.

use crate::client::ResultLinkClient;
use crate::error::{Error, LinkResolutionError, Result};
use crate::reader::chunk_store::ChunkStore;
use crate::types::cloudfetch::CloudFetchLink;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn, Instrument, Span};

/// Resolves a usable presigned link for a chunk index.
#[async_trait]
pub trait ChunkLinkResolver: Send + Sync + std::fmt::Debug {
    /// Wait until a link for `chunk_index` is available.
    async fn resolve(&self, chunk_index: i64) -> Result<CloudFetchLink>;

    /// Wait for a replacement of the link `stale_url`, which storage refused
    /// even though it had not expired by the local clock.
    ///
    /// Resolvers that cannot force a refresh hand out whatever `resolve` does.
    async fn refresh(&self, chunk_index: i64, stale_url: &str) -> Result<CloudFetchLink> {
        let _ = stale_url;
        self.resolve(chunk_index).await
    }

    /// Fail every outstanding and future `resolve` call.
    fn shutdown(&self);
}

#[derive(Debug, Clone)]
enum SlotState {
    Unresolved,
    Resolved(CloudFetchLink),
    Failed(Error),
}

#[derive(Debug)]
struct ResolverState {
    /// Dropping a sender supersedes the slot; its waiters re-subscribe.
    slots: Vec<watch::Sender<SlotState>>,
    next_batch_start: i64,
    /// Bumped whenever the running chain is aborted.
    generation: u64,
    chain: Option<JoinHandle<()>>,
    shut_down: bool,
}

#[derive(Debug)]
struct Inner {
    client: Arc<dyn ResultLinkClient>,
    statement_id: String,
    store: Arc<ChunkStore>,
    total_chunks: i64,
    runtime_handle: tokio::runtime::Handle,
    /// Span of the result this resolver serves; the fetch chain runs in it.
    span: Span,
    state: Mutex<ResolverState>,
}

/// [`ChunkLinkResolver`] backed by a [`ResultLinkClient`].
#[derive(Debug)]
pub struct LinkResolver {
    inner: Arc<Inner>,
}

impl LinkResolver {
    /// Create a resolver for one statement's result.
    ///
    /// `initial_links` (from the execute response) are installed as resolved
    /// slots and recorded in `store`. The fetch chain starts lazily on the
    /// first request for an unresolved chunk.
    pub fn new(
        client: Arc<dyn ResultLinkClient>,
        statement_id: impl Into<String>,
        store: Arc<ChunkStore>,
        initial_links: &[CloudFetchLink],
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let total_chunks = store.total_chunks();
        let slots: Vec<_> = (0..total_chunks)
            .map(|_| watch::channel(SlotState::Unresolved).0)
            .collect();

        for link in initial_links {
            if link.chunk_index < 0 || link.chunk_index >= total_chunks {
                warn!(
                    "Ignoring initial link for chunk {} (total chunks: {})",
                    link.chunk_index, total_chunks
                );
                continue;
            }
            if let Err(e) = store.set_link(link.chunk_index, link.clone()) {
                warn!("Chunk {}: failed to record initial link: {}", link.chunk_index, e);
            }
            slots[link.chunk_index as usize].send_replace(SlotState::Resolved(link.clone()));
        }

        let next_batch_start = slots
            .iter()
            .position(|slot| !matches!(*slot.borrow(), SlotState::Resolved(_)))
            .map(|i| i as i64)
            .unwrap_or(total_chunks);

        debug!(
            "LinkResolver: {} initial links, next_batch_start={}, total_chunks={}",
            initial_links.len(),
            next_batch_start,
            total_chunks
        );

        Self {
            inner: Arc::new(Inner {
                client,
                statement_id: statement_id.into(),
                store,
                total_chunks,
                runtime_handle,
                span: Span::current(),
                state: Mutex::new(ResolverState {
                    slots,
                    next_batch_start,
                    generation: 0,
                    chain: None,
                    shut_down: false,
                }),
            }),
        }
    }

    /// Index the next batch RPC will start at.
    pub fn next_batch_start(&self) -> i64 {
        self.inner.lock_state().next_batch_start
    }

    /// Whether a batch fetch chain is currently running.
    pub fn is_fetching(&self) -> bool {
        self.inner.lock_state().chain.is_some()
    }
}

impl Drop for LinkResolver {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[async_trait]
impl ChunkLinkResolver for LinkResolver {
    async fn resolve(&self, chunk_index: i64) -> Result<CloudFetchLink> {
        self.wait_for_link(chunk_index, None).await
    }

    async fn refresh(&self, chunk_index: i64, stale_url: &str) -> Result<CloudFetchLink> {
        self.wait_for_link(chunk_index, Some(stale_url)).await
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl LinkResolver {
    /// Subscribe to the chunk's slot and wait for it to settle. A superseded
    /// slot is followed to its replacement; `stale_url` only forces the first
    /// subscription to reset.
    async fn wait_for_link(
        &self,
        chunk_index: i64,
        mut stale_url: Option<&str>,
    ) -> Result<CloudFetchLink> {
        loop {
            let mut rx = self.inner.subscribe(chunk_index, stale_url.take())?;

            let outcome = rx
                .wait_for(|slot| !matches!(slot, SlotState::Unresolved))
                .await
                .map(|slot| slot.clone());

            match outcome {
                Ok(SlotState::Resolved(link)) => return Ok(link),
                Ok(SlotState::Failed(e)) => return Err(e),
                Ok(SlotState::Unresolved) => continue,
                Err(_) => {
                    trace!("Chunk {}: resolution slot superseded, re-subscribing", chunk_index);
                    continue;
                }
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate the request, run the expiry check and hand back a receiver
    /// for the chunk's slot. The whole check-scan-reset sequence runs under
    /// the state lock.
    ///
    /// `stale_url` names a link storage refused; if the slot still holds it,
    /// the chain restarts at this chunk (or earlier, if it has not got there).
    fn subscribe(
        self: &Arc<Self>,
        chunk_index: i64,
        stale_url: Option<&str>,
    ) -> Result<watch::Receiver<SlotState>> {
        if chunk_index < 0 || chunk_index >= self.total_chunks {
            return Err(LinkResolutionError::OutOfRange {
                chunk_index,
                total_chunks: self.total_chunks,
            }
            .into());
        }

        let mut state = self.lock_state();
        if state.shut_down {
            return Err(LinkResolutionError::Shutdown.into());
        }

        // A chain task that died without reporting back cannot be trusted
        if state.chain.as_ref().is_some_and(|chain| chain.is_finished()) {
            warn!("Link fetch chain ended unexpectedly, restarting");
            state.chain = None;
        }

        let slot_index = chunk_index as usize;
        let current = state.slots[slot_index].borrow().clone();
        match current {
            SlotState::Resolved(link) if stale_url == Some(link.url.as_str()) => {
                let reset_start = chunk_index.min(state.next_batch_start);
                debug!(
                    "Chunk {}: link rejected by storage, restarting link fetch at chunk {}",
                    chunk_index, reset_start
                );
                self.reset_from(&mut state, reset_start);
            }
            SlotState::Resolved(link)
                if link.is_expired() && self.is_awaiting_download(chunk_index) =>
            {
                let earliest = self
                    .earliest_expired_undownloaded(&state)
                    .unwrap_or(chunk_index)
                    .min(chunk_index);
                let reset_start = earliest.min(state.next_batch_start);
                debug!(
                    "Chunk {}: link expired before download, restarting link fetch at chunk {}",
                    chunk_index, reset_start
                );
                self.reset_from(&mut state, reset_start);
            }
            SlotState::Failed(_) => {
                let restart = state
                    .slots
                    .iter()
                    .position(|slot| !matches!(*slot.borrow(), SlotState::Resolved(_)))
                    .map(|i| i as i64)
                    .unwrap_or(chunk_index)
                    .min(chunk_index);
                debug!(
                    "Chunk {}: previous link fetch failed, restarting at chunk {}",
                    chunk_index, restart
                );
                self.reset_from(&mut state, restart);
            }
            SlotState::Unresolved if state.chain.is_none() => {
                self.start_chain(&mut state);
            }
            _ => {}
        }

        Ok(state.slots[slot_index].subscribe())
    }

    fn is_awaiting_download(&self, chunk_index: i64) -> bool {
        self.store
            .status(chunk_index)
            .map(|status| status.is_awaiting_download())
            .unwrap_or(false)
    }

    /// Earliest chunk, from index 0, whose resolved link has expired while
    /// its payload has not been downloaded yet.
    fn earliest_expired_undownloaded(&self, state: &ResolverState) -> Option<i64> {
        state.slots.iter().enumerate().find_map(|(i, slot)| {
            let expired =
                matches!(&*slot.borrow(), SlotState::Resolved(link) if link.is_expired());
            (expired && self.is_awaiting_download(i as i64)).then_some(i as i64)
        })
    }

    /// Abort the running chain, supersede every slot from `start` onward and
    /// restart the chain there. Slots before `start` are left untouched.
    fn reset_from(self: &Arc<Self>, state: &mut ResolverState, start: i64) {
        if let Some(chain) = state.chain.take() {
            chain.abort();
        }
        state.generation += 1;

        for slot in state.slots.iter_mut().skip(start as usize) {
            *slot = watch::channel(SlotState::Unresolved).0;
        }
        state.next_batch_start = start;
        self.start_chain(state);
    }

    fn start_chain(self: &Arc<Self>, state: &mut ResolverState) {
        if state.next_batch_start >= self.total_chunks {
            return;
        }
        trace!(
            "Starting link fetch chain at chunk {} (generation {})",
            state.next_batch_start,
            state.generation
        );
        let inner = Arc::clone(self);
        let generation = state.generation;
        let chain = async move {
            let mut guard = ChainGuard {
                inner: Arc::clone(&inner),
                generation,
                armed: true,
            };
            inner.run_chain(generation).await;
            guard.armed = false;
        };
        state.chain = Some(
            self.runtime_handle
                .spawn(chain.instrument(self.span.clone())),
        );
    }

    async fn run_chain(self: Arc<Self>, generation: u64) {
        loop {
            let start = {
                let mut state = self.lock_state();
                if state.generation != generation || state.shut_down {
                    return;
                }
                if state.next_batch_start >= self.total_chunks {
                    state.chain = None;
                    debug!("All {} chunk links fetched", self.total_chunks);
                    return;
                }
                state.next_batch_start
            };

            debug!("Fetching result links starting at chunk {}", start);
            let result = self
                .client
                .list_result_links(&self.statement_id, start)
                .await
                .and_then(|links| self.validate_batch(start, links));

            let mut state = self.lock_state();
            if state.generation != generation || state.shut_down {
                trace!("Dropping links fetched by a superseded chain at chunk {}", start);
                return;
            }

            match result {
                Ok(links) => {
                    let count = links.len() as i64;
                    for link in links {
                        let index = link.chunk_index;
                        if let Err(e) = self.store.set_link(index, link.clone()) {
                            warn!("Chunk {}: failed to record link: {}", index, e);
                        }
                        state.slots[index as usize].send_replace(SlotState::Resolved(link));
                    }
                    state.next_batch_start = start + count;
                    trace!(
                        "Resolved chunks {}..{}, next_batch_start={}",
                        start,
                        start + count,
                        state.next_batch_start
                    );
                }
                Err(e) => {
                    error!("Failed to fetch result links at chunk {}: {}", start, e);
                    let failure = Error::from(LinkResolutionError::Rpc(e.to_string()));
                    Self::fail_unresolved(&state, &failure);
                    state.chain = None;
                    return;
                }
            }
        }
    }

    /// Fail every unresolved slot with `failure`.
    fn fail_unresolved(state: &ResolverState, failure: &Error) {
        for slot in state.slots.iter() {
            slot.send_if_modified(|value| {
                if matches!(value, SlotState::Unresolved) {
                    *value = SlotState::Failed(failure.clone());
                    true
                } else {
                    false
                }
            });
        }
    }

    /// A batch must start at `start`, be contiguous and stay within range.
    fn validate_batch(&self, start: i64, links: Vec<CloudFetchLink>) -> Result<Vec<CloudFetchLink>> {
        if links.is_empty() {
            return Err(Error::from(LinkResolutionError::Rpc(format!(
                "no links returned for chunk {}",
                start
            ))));
        }
        for (offset, link) in links.iter().enumerate() {
            let expected = start + offset as i64;
            if link.chunk_index != expected {
                return Err(Error::from(LinkResolutionError::Rpc(format!(
                    "non-contiguous link batch: expected chunk {}, got {}",
                    expected, link.chunk_index
                ))));
            }
            if link.chunk_index >= self.total_chunks {
                return Err(Error::from(LinkResolutionError::Rpc(format!(
                    "link for chunk {} beyond total chunks {}",
                    link.chunk_index, self.total_chunks
                ))));
            }
        }
        Ok(links)
    }

    fn shutdown(&self) {
        let mut state = self.lock_state();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.generation += 1;
        if let Some(chain) = state.chain.take() {
            chain.abort();
        }

        Self::fail_unresolved(&state, &Error::from(LinkResolutionError::Shutdown));
        debug!("LinkResolver for statement {} shut down", self.statement_id);
    }
}

/// Dropped with the chain task. A chain that never finished (it panicked)
/// while still current fails its waiters instead of leaving them hanging.
/// Aborted chains are ignored: reset and shutdown bump the generation first.
struct ChainGuard {
    inner: Arc<Inner>,
    generation: u64,
    armed: bool,
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock_state();
        if state.generation != self.generation || state.shut_down {
            return;
        }
        error!(
            "Link fetch chain panicked at chunk {}",
            state.next_batch_start
        );
        let failure = Error::from(LinkResolutionError::Rpc(
            "link fetch task panicked".to_string(),
        ));
        Inner::fail_unresolved(&state, &failure);
        state.chain = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::chunk_store::ChunkStatus;
    use crate::types::manifest::{ChunkInfo, CompressionCodec};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    /// Mock link client returning runs of `batch_size` links.
    #[derive(Debug)]
    struct MockLinkClient {
        total_chunks: i64,
        batch_size: i64,
        calls: Mutex<Vec<i64>>,
        fail: AtomicBool,
        panic_next: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl MockLinkClient {
        fn new(total_chunks: i64, batch_size: i64) -> Self {
            Self {
                total_chunks,
                batch_size,
                calls: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                panic_next: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn with_gate(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResultLinkClient for MockLinkClient {
        async fn list_result_links(
            &self,
            _statement_id: &str,
            start_chunk_index: i64,
        ) -> Result<Vec<CloudFetchLink>> {
            let call_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(start_chunk_index);
                calls.len()
            };
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("link service blew up at chunk {}", start_chunk_index);
            }
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::download(start_chunk_index, "HTTP 503"));
            }

            let end = (start_chunk_index + self.batch_size).min(self.total_chunks);
            Ok((start_chunk_index..end)
                .map(|i| create_test_link(i, &format!("call{}", call_number), 3600))
                .collect())
        }
    }

    fn create_test_link(chunk_index: i64, tag: &str, expires_in_secs: i64) -> CloudFetchLink {
        CloudFetchLink {
            url: format!("https://storage.example.com/{}/chunk{}", tag, chunk_index),
            chunk_index,
            row_offset: chunk_index * 10,
            row_count: 10,
            byte_count: 1000,
            expiration: chrono::Utc::now() + chrono::Duration::seconds(expires_in_secs),
            http_headers: HashMap::new(),
        }
    }

    fn create_store(total_chunks: i64) -> Arc<ChunkStore> {
        let infos: Vec<ChunkInfo> = (0..total_chunks)
            .map(|i| ChunkInfo {
                chunk_index: i,
                row_offset: i * 10,
                row_count: 10,
                byte_count: 1000,
            })
            .collect();
        Arc::new(ChunkStore::from_chunk_infos(&infos, CompressionCodec::None).unwrap())
    }

    fn create_resolver(
        client: Arc<MockLinkClient>,
        store: Arc<ChunkStore>,
        initial_links: &[CloudFetchLink],
    ) -> LinkResolver {
        LinkResolver::new(
            client,
            "test-statement",
            store,
            initial_links,
            tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_batches_are_contiguous_from_next_start() {
        let client = Arc::new(MockLinkClient::new(10, 4));
        let store = create_store(10);
        let initial: Vec<_> = (0..3).map(|i| create_test_link(i, "initial", 3600)).collect();
        let resolver = create_resolver(Arc::clone(&client), Arc::clone(&store), &initial);
        assert_eq!(resolver.next_batch_start(), 3);

        // Initial links resolve without any RPC
        let link = resolver.resolve(1).await.unwrap();
        assert!(link.url.contains("initial"));
        assert!(client.calls().is_empty());

        let link = resolver.resolve(5).await.unwrap();
        assert_eq!(link.chunk_index, 5);
        let link = resolver.resolve(9).await.unwrap();
        assert_eq!(link.chunk_index, 9);

        // First RPC returns 3..=6, so the chain continues at 7
        assert_eq!(client.calls(), vec![3, 7]);
        assert_eq!(resolver.next_batch_start(), 10);
        assert_eq!(store.status(6).unwrap(), ChunkStatus::UrlFetched);
    }

    #[tokio::test]
    async fn test_only_one_batch_call_in_flight() {
        let client = Arc::new(MockLinkClient::new(12, 2));
        let store = create_store(12);
        let resolver = Arc::new(create_resolver(Arc::clone(&client), store, &[]));

        let mut handles = Vec::new();
        for i in (0..12).rev() {
            let resolver = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move { resolver.resolve(i).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(client.calls(), vec![0, 2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn test_expired_link_restarts_chain_at_earliest_expired_chunk() {
        let client = Arc::new(MockLinkClient::new(5, 10));
        let store = create_store(5);
        let initial = vec![
            create_test_link(0, "initial", 3600),
            create_test_link(1, "initial", 3600),
            // Inside the 60s safety buffer
            create_test_link(2, "initial", 30),
        ];
        let resolver = create_resolver(Arc::clone(&client), Arc::clone(&store), &initial);

        let link = resolver.resolve(2).await.unwrap();
        assert!(!link.is_expired());
        assert!(link.url.contains("call1"));
        assert_eq!(client.calls(), vec![2]);

        // Earlier, still valid links are untouched
        let link0 = resolver.resolve(0).await.unwrap();
        assert_eq!(link0, initial[0]);
        let link1 = resolver.resolve(1).await.unwrap();
        assert_eq!(link1, initial[1]);
        assert_eq!(client.calls(), vec![2]);

        // The store carries the refreshed link
        assert_eq!(store.link(2).unwrap().url, link.url);
    }

    #[tokio::test]
    async fn test_expired_first_chunk_is_refreshed() {
        let client = Arc::new(MockLinkClient::new(3, 10));
        let store = create_store(3);
        let initial = vec![
            create_test_link(0, "initial", 10),
            create_test_link(1, "initial", 3600),
        ];
        let resolver = create_resolver(Arc::clone(&client), store, &initial);

        // Chunk 1 is valid, but chunk 0 is the earliest expired undownloaded chunk
        let link = resolver.resolve(1).await.unwrap();
        assert!(link.url.contains("initial"));

        let link = resolver.resolve(0).await.unwrap();
        assert!(!link.is_expired());
        assert_eq!(client.calls()[0], 0);
    }

    #[tokio::test]
    async fn test_reset_ignores_downloaded_chunks() {
        let client = Arc::new(MockLinkClient::new(4, 10));
        let store = create_store(4);
        let initial = vec![
            create_test_link(0, "initial", 10),
            create_test_link(1, "initial", 3600),
            create_test_link(2, "initial", 10),
        ];
        let resolver = create_resolver(Arc::clone(&client), Arc::clone(&store), &initial);

        // Chunk 0 has already been downloaded with its (now expiring) link
        store.transition(0, ChunkStatus::DownloadInProgress).unwrap();
        store.transition(0, ChunkStatus::DownloadSucceeded).unwrap();

        let link = resolver.resolve(2).await.unwrap();
        assert!(!link.is_expired());
        assert_eq!(client.calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_expiry_reset_cancels_in_flight_batch_fetch() {
        let gate = Arc::new(Notify::new());
        let client = Arc::new(MockLinkClient::new(6, 2).with_gate(Arc::clone(&gate)));
        let store = create_store(6);
        let initial = vec![
            create_test_link(0, "initial", 3600),
            create_test_link(1, "initial", 30),
        ];
        let resolver = Arc::new(create_resolver(Arc::clone(&client), store, &initial));
        assert_eq!(resolver.next_batch_start(), 2);

        // Parks on the batch call starting at chunk 2
        let waiter3 = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.calls(), vec![2]);

        // Chunk 1 is inside the expiry buffer: the parked call is abandoned
        let waiter1 = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(1).await })
        };
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.notify_one();
        }

        let link1 = timeout(Duration::from_secs(5), waiter1)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let link3 = timeout(Duration::from_secs(5), waiter3)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(client.calls(), vec![2, 1, 3, 5]);
        assert!(link1.url.contains("/call2/"));
        assert!(link3.url.contains("/call3/"));
        // Nothing from the abandoned call was ever installed
        for index in 1..6 {
            let link = resolver.resolve(index).await.unwrap();
            assert!(!link.url.contains("/call1/"));
        }
        assert_eq!(resolver.resolve(0).await.unwrap(), initial[0]);
    }

    #[tokio::test]
    async fn test_refresh_replaces_link_rejected_by_storage() {
        let client = Arc::new(MockLinkClient::new(4, 10));
        let store = create_store(4);
        let initial: Vec<_> = (0..4).map(|i| create_test_link(i, "initial", 3600)).collect();
        let resolver = create_resolver(Arc::clone(&client), Arc::clone(&store), &initial);

        // Valid by the local clock, but storage said no
        let link = resolver.refresh(2, &initial[2].url).await.unwrap();
        assert!(link.url.contains("/call1/"));
        assert_eq!(client.calls(), vec![2]);

        // Earlier links are kept
        assert_eq!(resolver.resolve(1).await.unwrap(), initial[1]);

        // A stale URL that was already replaced does not trigger another RPC
        let again = resolver.refresh(2, &initial[2].url).await.unwrap();
        assert_eq!(again, link);
        assert_eq!(client.calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_panicked_chain_fails_waiters_and_restarts() {
        let client = Arc::new(MockLinkClient::new(3, 10));
        client.panic_next.store(true, Ordering::SeqCst);
        let resolver = create_resolver(Arc::clone(&client), create_store(3), &[]);

        let result = timeout(Duration::from_secs(5), resolver.resolve(2))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::LinkResolution(LinkResolutionError::Rpc(_)))
        ));
        assert!(!resolver.is_fetching());

        let link = timeout(Duration::from_secs(5), resolver.resolve(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.chunk_index, 2);
        assert_eq!(client.calls(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_rpc_failure_fails_all_outstanding_slots() {
        let gate = Arc::new(Notify::new());
        let client = Arc::new(MockLinkClient::new(6, 2).with_gate(Arc::clone(&gate)));
        client.fail.store(true, Ordering::SeqCst);
        let store = create_store(6);
        let resolver = Arc::new(create_resolver(Arc::clone(&client), store, &[]));

        let waiters: Vec<_> = [1, 3, 5]
            .into_iter()
            .map(|i| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve(i).await })
            })
            .collect();

        // Let every waiter subscribe before the RPC completes
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        for waiter in waiters {
            let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
            assert!(matches!(
                result,
                Err(Error::LinkResolution(LinkResolutionError::Rpc(_)))
            ));
        }
        assert_eq!(client.calls(), vec![0]);
        assert!(!resolver.is_fetching());

        // A later request restarts the chain from the earliest unresolved chunk
        client.fail.store(false, Ordering::SeqCst);
        let retry = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let link = timeout(Duration::from_secs(5), retry)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(link.chunk_index, 3);
        assert_eq!(client.calls(), vec![0, 0, 2]);
    }

    #[tokio::test]
    async fn test_out_of_range_index() {
        let client = Arc::new(MockLinkClient::new(3, 10));
        let resolver = create_resolver(client, create_store(3), &[]);

        for index in [-1, 3, 100] {
            assert!(matches!(
                resolver.resolve(index).await,
                Err(Error::LinkResolution(LinkResolutionError::OutOfRange { .. }))
            ));
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_future_requests() {
        let gate = Arc::new(Notify::new());
        let client = Arc::new(MockLinkClient::new(4, 10).with_gate(gate));
        let initial = vec![create_test_link(0, "initial", 3600)];
        let resolver = Arc::new(create_resolver(client, create_store(4), &initial));

        let waiter = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(resolver.is_fetching());

        resolver.shutdown();

        let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(Error::LinkResolution(LinkResolutionError::Shutdown))
        ));

        // Even resolved links are no longer handed out
        assert!(matches!(
            resolver.resolve(0).await,
            Err(Error::LinkResolution(LinkResolutionError::Shutdown))
        ));
        assert!(!resolver.is_fetching());
    }
}
