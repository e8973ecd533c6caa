//! Debounced, staggered thumbnail fetching.
//!
//! Requests that miss the cache are queued. Once the queue has been quiet for
//! the debounce window it is split into sub-batches, each scheduled one
//! stagger step after the previous, and each sub-batch runs a bounded number
//! of fetches at a time. Failures fall back to the placeholder and are not
//! retried.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Lookup, ThumbnailCache};
use crate::config::ThumbnailConfig;
use crate::diagnostics::Diagnostics;
use crate::error::FeedError;
use crate::events::FeedEvent;
use crate::models::Event;
use crate::scheduler::Scheduler;

/// Source of raw file bytes
pub trait FileFetcher: Send + Sync {
    fn fetch(&self, file_id: &str) -> BoxFuture<'static, Result<Bytes, FeedError>>;
}

/// What happened to a thumbnail request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No thumbnail attachment, placeholder assigned
    Placeholder,
    Cached,
    /// Someone else is already fetching the file
    InFlight,
    Queued,
}

#[derive(Debug, Default)]
struct BatchQueue {
    events: Vec<Event>,
    queued: HashSet<String>,
    /// Bumped on every enqueue; a flush only runs if it is still current
    generation: u64,
}

struct BatchInner {
    cache: ThumbnailCache,
    fetcher: Arc<dyn FileFetcher>,
    scheduler: Arc<dyn Scheduler>,
    config: ThumbnailConfig,
    diagnostics: Diagnostics,
    events: broadcast::Sender<FeedEvent>,
    queue: Mutex<BatchQueue>,
}

#[derive(Clone)]
pub struct ThumbnailBatchLoader {
    inner: Arc<BatchInner>,
}

impl ThumbnailBatchLoader {
    pub fn new(
        cache: ThumbnailCache,
        fetcher: Arc<dyn FileFetcher>,
        scheduler: Arc<dyn Scheduler>,
        config: ThumbnailConfig,
        diagnostics: Diagnostics,
        events: broadcast::Sender<FeedEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                cache,
                fetcher,
                scheduler,
                config,
                diagnostics,
                events,
                queue: Mutex::new(BatchQueue::default()),
            }),
        }
    }

    pub fn cache(&self) -> &ThumbnailCache {
        &self.inner.cache
    }

    /// Number of events waiting for the next flush
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().events.len()
    }

    /// Resolve the event's thumbnail from cache, or queue a fetch
    pub fn request(&self, event: &Event) -> Resolution {
        let inner = &self.inner;
        match inner.cache.lookup_or_wait(event) {
            Lookup::NoThumbnail => {
                inner.cache.assign_placeholder(&event.id, None);
                inner.diagnostics.thumbnail_finished(&event.id);
                inner.diagnostics.record(|s| s.thumbnail_placeholders += 1);
                inner.notify(&event.id);
                Resolution::Placeholder
            }
            Lookup::Cached(_) => {
                inner.diagnostics.thumbnail_finished(&event.id);
                inner.diagnostics.record(|s| s.thumbnail_cache_hits += 1);
                Resolution::Cached
            }
            Lookup::InFlight(_) => {
                // resolved when the other fetch settles
                inner.diagnostics.thumbnail_started(&event.id);
                inner.diagnostics.record(|s| s.thumbnail_skipped_in_flight += 1);
                Resolution::InFlight
            }
            Lookup::Miss(_) => {
                self.enqueue(event);
                Resolution::Queued
            }
        }
    }

    fn enqueue(&self, event: &Event) {
        let generation = {
            let mut queue = self.inner.queue.lock();
            if queue.queued.insert(event.id.clone()) {
                queue.events.push(event.clone());
            }
            queue.generation += 1;
            queue.generation
        };
        self.inner.diagnostics.thumbnail_started(&event.id);

        let this = self.clone();
        self.inner.scheduler.submit(
            self.inner.config.debounce(),
            async move { this.flush(generation) }.boxed(),
        );
    }

    /// Split the queue into staggered sub-batches, unless a newer request
    /// re-armed the debounce
    fn flush(&self, generation: u64) {
        let batch = {
            let mut queue = self.inner.queue.lock();
            if queue.generation != generation {
                return;
            }
            queue.queued.clear();
            std::mem::take(&mut queue.events)
        };
        if batch.is_empty() {
            return;
        }

        let size = self.inner.config.sub_batch_size.max(1);
        let stagger = self.inner.config.stagger();
        tracing::debug!(
            "Flushing {} thumbnail requests in sub-batches of {}",
            batch.len(),
            size
        );

        for (i, chunk) in batch.chunks(size).enumerate() {
            let this = self.clone();
            let chunk = chunk.to_vec();
            let delay = stagger * u32::try_from(i).unwrap_or(u32::MAX);
            self.inner
                .scheduler
                .submit(delay, async move { this.run_sub_batch(chunk).await }.boxed());
        }
    }

    async fn run_sub_batch(&self, events: Vec<Event>) {
        let limit = self.inner.config.max_concurrent.max(1);
        futures::stream::iter(events)
            .map(|event| self.fetch_one(event))
            .buffer_unordered(limit)
            .collect::<Vec<()>>()
            .await;
    }

    async fn fetch_one(&self, event: Event) {
        let inner = &self.inner;

        // the cache may have filled while the event sat in the queue
        let file_id = match inner.cache.lookup_or_wait(&event) {
            Lookup::Miss(file_id) => file_id,
            Lookup::Cached(_) => {
                inner.diagnostics.thumbnail_finished(&event.id);
                inner.notify(&event.id);
                return;
            }
            Lookup::NoThumbnail => {
                inner.cache.assign_placeholder(&event.id, None);
                inner.diagnostics.thumbnail_finished(&event.id);
                inner.notify(&event.id);
                return;
            }
            Lookup::InFlight(_) => {
                inner.diagnostics.record(|s| s.thumbnail_skipped_in_flight += 1);
                return;
            }
        };

        if !inner.cache.try_begin_for(&file_id, &event.id) {
            inner.diagnostics.record(|s| s.thumbnail_skipped_in_flight += 1);
            return;
        }

        inner.diagnostics.record(|s| s.thumbnail_fetches += 1);
        tracing::debug!("Fetching thumbnail {} for event {}", file_id, event.id);

        let waiters = match inner.fetcher.fetch(&file_id).await {
            Ok(bytes) => inner.cache.complete_success(&event.id, &file_id, bytes).waiters,
            Err(e) => {
                tracing::warn!("Thumbnail fetch failed for event {}: {}", event.id, e);
                inner.diagnostics.record(|s| s.thumbnail_failures += 1);
                inner.cache.complete_failure(&event.id, &file_id)
            }
        };

        for id in std::iter::once(&event.id).chain(waiters.iter()) {
            inner.diagnostics.thumbnail_finished(id);
            inner.notify(id);
        }
    }
}

impl BatchInner {
    fn notify(&self, event_id: &str) {
        let _ = self.events.send(FeedEvent::ThumbnailReady {
            event_id: event_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachedFile;
    use crate::scheduler::ManualScheduler;
    use crate::thumbnails::Thumbnail;
    use futures::future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct TestFetcher {
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl TestFetcher {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl FileFetcher for TestFetcher {
        fn fetch(&self, file_id: &str) -> BoxFuture<'static, Result<Bytes, FeedError>> {
            self.calls.lock().push(file_id.to_string());
            let fail = self.failing.contains(file_id);
            let file_id = file_id.to_string();
            let active = self.active.clone();
            let max_active = self.max_active.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                if fail {
                    Err(FeedError::ThumbnailFetch {
                        file_id,
                        message: "HTTP 500".to_string(),
                    })
                } else {
                    Ok(Bytes::from(format!("bytes-of-{}", file_id)))
                }
            }
            .boxed()
        }
    }

    fn event(id: &str, files: &[&str]) -> Event {
        let mut event = Event::new(id, id);
        for (i, name) in files.iter().enumerate() {
            event.files.push(AttachedFile {
                id: format!("{}-f{}", id, i),
                name: name.to_string(),
                mime_type: None,
                size: None,
            });
        }
        event
    }

    fn thumb_event(id: &str) -> Event {
        event(id, &["thumbnail.jpg"])
    }

    struct Harness {
        loader: ThumbnailBatchLoader,
        fetcher: Arc<TestFetcher>,
        scheduler: ManualScheduler,
        diagnostics: Diagnostics,
    }

    fn harness_with(fetcher: TestFetcher, cache: ThumbnailCache) -> Harness {
        let fetcher = Arc::new(fetcher);
        let scheduler = ManualScheduler::new();
        let diagnostics = Diagnostics::new();
        let (events, _) = broadcast::channel(64);
        let loader = ThumbnailBatchLoader::new(
            cache,
            fetcher.clone(),
            Arc::new(scheduler.clone()),
            ThumbnailConfig::default(),
            diagnostics.clone(),
            events,
        );
        Harness {
            loader,
            fetcher,
            scheduler,
            diagnostics,
        }
    }

    fn harness() -> Harness {
        harness_with(TestFetcher::default(), ThumbnailCache::new())
    }

    #[tokio::test]
    async fn test_event_without_thumbnail_gets_placeholder_immediately() {
        let h = harness();
        let plain = event("e1", &["trip_thumb.jpg", "map.png"]);

        assert_eq!(h.loader.request(&plain), Resolution::Placeholder);
        assert_eq!(h.loader.cache().resolved("e1"), Some(Thumbnail::Placeholder));
        assert_eq!(h.scheduler.pending_count(), 0);
        assert_eq!(h.diagnostics.snapshot().thumbnail_placeholders, 1);
    }

    #[tokio::test]
    async fn test_only_thumbnail_named_file_is_fetched() {
        let h = harness();
        let trip = event("e1", &["map.png", "trip_thumbnail_01.jpg"]);

        assert_eq!(h.loader.request(&trip), Resolution::Queued);
        h.scheduler.advance(Duration::from_millis(200)).await;

        assert_eq!(h.fetcher.calls(), vec!["e1-f1".to_string()]);
        assert!(h.loader.cache().has_image("e1"));
    }

    #[tokio::test]
    async fn test_debounce_waits_for_quiet_period() {
        let h = harness();

        h.loader.request(&thumb_event("e1"));
        h.scheduler.advance(Duration::from_millis(150)).await;
        h.loader.request(&thumb_event("e2"));
        h.scheduler.advance(Duration::from_millis(150)).await;
        assert!(h.fetcher.calls().is_empty());
        assert_eq!(h.loader.queued(), 2);

        h.scheduler.advance(Duration::from_millis(50)).await;
        assert_eq!(h.fetcher.calls().len(), 2);
        assert_eq!(h.loader.queued(), 0);
    }

    #[tokio::test]
    async fn test_sub_batches_are_staggered() {
        let h = harness();
        for i in 0..12 {
            h.loader.request(&thumb_event(&format!("e{i}")));
        }

        h.scheduler.advance(Duration::from_millis(200)).await;
        assert_eq!(h.fetcher.calls().len(), 5);
        assert_eq!(
            h.scheduler.pending_due_times(),
            vec![Duration::from_millis(300), Duration::from_millis(400)]
        );

        h.scheduler.advance(Duration::from_millis(100)).await;
        assert_eq!(h.fetcher.calls().len(), 10);

        h.scheduler.advance(Duration::from_millis(100)).await;
        assert_eq!(h.fetcher.calls().len(), 12);
    }

    #[tokio::test]
    async fn test_concurrency_capped_per_sub_batch() {
        let h = harness();
        for i in 0..5 {
            h.loader.request(&thumb_event(&format!("e{i}")));
        }
        h.scheduler.advance(Duration::from_millis(200)).await;

        assert_eq!(h.fetcher.calls().len(), 5);
        assert_eq!(h.fetcher.max_active.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_duplicate_requests_queue_once() {
        let h = harness();
        let e = thumb_event("e1");
        h.loader.request(&e);
        h.loader.request(&e);

        assert_eq!(h.loader.queued(), 1);
        h.scheduler.advance(Duration::from_millis(200)).await;
        assert_eq!(h.fetcher.calls().len(), 1);
        assert_eq!(h.loader.request(&e), Resolution::Cached);
    }

    #[tokio::test]
    async fn test_file_loading_elsewhere_is_skipped() {
        // a second component shares the cache and already holds the marker
        let cache = ThumbnailCache::new();
        let h = harness_with(TestFetcher::default(), cache.clone());
        let e = thumb_event("e1");
        assert!(cache.try_begin("e1-f0"));

        assert_eq!(h.loader.request(&e), Resolution::InFlight);
        h.scheduler.advance(Duration::from_secs(1)).await;
        assert!(h.fetcher.calls().is_empty());

        // the other component finishes; our next request hits the shared tier
        cache.complete_success("other-event", "e1-f0", Bytes::from_static(b"x"));
        assert_eq!(h.loader.request(&e), Resolution::Cached);
        assert!(h.loader.cache().has_image("e1"));
    }

    #[tokio::test]
    async fn test_two_loaders_fetch_shared_file_once() {
        let cache = ThumbnailCache::new();
        let a = harness_with(TestFetcher::default(), cache.clone());
        let b = harness_with(TestFetcher::default(), cache.clone());

        let mut first = thumb_event("e1");
        first.files[0].id = "shared".to_string();
        let mut second = thumb_event("e2");
        second.files[0].id = "shared".to_string();

        a.loader.request(&first);
        b.loader.request(&second);

        // run both flushes at once so the fetches race for the marker
        future::join(
            a.scheduler.advance(Duration::from_millis(200)),
            b.scheduler.advance(Duration::from_millis(200)),
        )
        .await;

        let total = a.fetcher.calls().len() + b.fetcher.calls().len();
        assert_eq!(total, 1);
        assert_eq!(cache.loading_count(), 0);
        assert!(cache.has_image("e1") || cache.has_image("e2"));
    }

    #[tokio::test]
    async fn test_events_sharing_a_file_all_resolve() {
        let h = harness();
        let mut ready = h.loader.inner.events.subscribe();

        let mut first = thumb_event("e1");
        first.files[0].id = "shared".to_string();
        let mut second = thumb_event("e2");
        second.files[0].id = "shared".to_string();

        h.diagnostics.card_rendered("e1");
        h.diagnostics.card_rendered("e2");
        assert_eq!(h.loader.request(&first), Resolution::Queued);
        assert_eq!(h.loader.request(&second), Resolution::Queued);
        h.scheduler.advance(Duration::from_secs(5)).await;

        assert_eq!(h.fetcher.calls(), vec!["shared".to_string()]);
        let cache = h.loader.cache();
        assert!(cache.has_image("e1"));
        assert!(cache.has_image("e2"));
        assert_eq!(cache.resolved("e1"), cache.resolved("e2"));
        assert_eq!(cache.loading_count(), 0);
        assert_eq!(h.diagnostics.pending_loads(), 0);

        let mut notified = Vec::new();
        while let Ok(FeedEvent::ThumbnailReady { event_id }) = ready.try_recv() {
            notified.push(event_id);
        }
        notified.sort();
        assert_eq!(notified, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn test_request_during_fetch_resolves_with_it() {
        let cache = ThumbnailCache::new();
        let h = harness_with(TestFetcher::failing(&["shared"]), cache.clone());
        let mut waiting = thumb_event("e2");
        waiting.files[0].id = "shared".to_string();

        assert!(cache.try_begin_for("shared", "e1"));
        assert_eq!(h.loader.request(&waiting), Resolution::InFlight);
        assert_eq!(cache.waiters("shared"), vec!["e2"]);

        cache.complete_failure("e1", "shared");
        assert_eq!(cache.resolved("e2"), Some(Thumbnail::Placeholder));
        assert!(h.fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_without_retry() {
        let h = harness_with(TestFetcher::failing(&["e1-f0"]), ThumbnailCache::new());
        let e = thumb_event("e1");

        h.loader.request(&e);
        h.scheduler.advance(Duration::from_millis(200)).await;

        assert_eq!(h.loader.cache().resolved("e1"), Some(Thumbnail::Placeholder));
        assert!(!h.loader.cache().is_loading("e1-f0"));
        assert_eq!(h.diagnostics.snapshot().thumbnail_failures, 1);

        assert_eq!(h.loader.request(&e), Resolution::Cached);
        h.scheduler.advance(Duration::from_secs(1)).await;
        assert_eq!(h.fetcher.calls().len(), 1);
    }
}
