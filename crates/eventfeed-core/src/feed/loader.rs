//! Streaming feed loader.
//!
//! Each query gets a strictly increasing request token. The stream task for
//! a query applies messages only while its token is current, so anything
//! arriving for a superseded query is dropped even if the task has not been
//! aborted yet.
//!
//! Per token the feed moves `Idle -> Streaming -> (Completed | Failed)`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::page::{FeedPage, Upsert};
use crate::config::CoreConfig;
use crate::diagnostics::Diagnostics;
use crate::error::FeedError;
use crate::events::FeedEvent;
use crate::models::Event;
use crate::streaming::{FeedItem, StreamMessage};
use crate::thumbnails::ThumbnailCache;

pub type MessageStream = BoxStream<'static, Result<StreamMessage, FeedError>>;

/// Opens the search stream for a query
pub trait FeedSource: Send + Sync {
    fn open(
        &self,
        query: &str,
        caller: &str,
    ) -> BoxFuture<'static, Result<MessageStream, FeedError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Idle,
    Streaming,
    Completed,
    Failed,
}

/// Point-in-time copy of the feed for rendering
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub token: u64,
    pub query: String,
    pub phase: FeedPhase,
    pub declared_total: Option<u64>,
    pub loading: bool,
    pub more_available: bool,
    pub buffered: usize,
    pub visible: Vec<FeedItem>,
}

struct FeedState {
    token: u64,
    query: String,
    phase: FeedPhase,
    declared_total: Option<u64>,
    loading: bool,
    more_available: bool,
    page: FeedPage,
    task: Option<JoinHandle<()>>,
}

impl FeedState {
    /// More to reveal from the buffer, or the server declared more results
    /// than are visible.
    ///
    /// The declared-total arm keeps this true after `complete` or the watchdog
    /// when fewer items arrived than declared, even though a growth request
    /// can then add nothing. Views should hide the sentinel on a growth
    /// request that returns 0.
    fn refresh_more_available(&mut self) {
        let visible = self.page.window().len();
        let declared_more = self
            .declared_total
            .map(|total| total > visible as u64)
            .unwrap_or(false);
        self.more_available = self.page.more_available() || declared_more;
    }

    fn is_streaming(&self, token: u64) -> bool {
        self.token == token && self.phase == FeedPhase::Streaming
    }

    fn window_grown(&self) -> FeedEvent {
        FeedEvent::WindowGrown {
            token: self.token,
            visible: self.page.window().len(),
            buffered: self.page.buffer().len(),
        }
    }
}

struct LoaderInner {
    source: Arc<dyn FeedSource>,
    caller: String,
    watchdog: Duration,
    cache: ThumbnailCache,
    diagnostics: Diagnostics,
    events: broadcast::Sender<FeedEvent>,
    state: Mutex<FeedState>,
}

#[derive(Clone)]
pub struct FeedLoader {
    inner: Arc<LoaderInner>,
}

impl FeedLoader {
    pub fn new(
        source: Arc<dyn FeedSource>,
        config: &CoreConfig,
        cache: ThumbnailCache,
        diagnostics: Diagnostics,
        events: broadcast::Sender<FeedEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                source,
                caller: config.caller_id.clone(),
                watchdog: config.watchdog(),
                cache,
                diagnostics,
                events,
                state: Mutex::new(FeedState {
                    token: 0,
                    query: String::new(),
                    phase: FeedPhase::Idle,
                    declared_total: None,
                    loading: false,
                    more_available: false,
                    page: FeedPage::new(config.page_size),
                    task: None,
                }),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &ThumbnailCache {
        &self.inner.cache
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    pub fn token(&self) -> u64 {
        self.inner.state.lock().token
    }

    pub fn phase(&self) -> FeedPhase {
        self.inner.state.lock().phase
    }

    /// Start a new query, superseding any running one.
    ///
    /// Buffer, window and thumbnail cache are cleared, the previous stream
    /// task is aborted and a new one is spawned. Returns the new token.
    pub fn reset_and_load(&self, query: &str) -> u64 {
        let (token, previous) = {
            let mut state = self.inner.state.lock();
            state.token += 1;
            state.query = query.to_string();
            state.phase = FeedPhase::Streaming;
            state.declared_total = None;
            state.loading = true;
            state.more_available = false;
            state.page.reset();
            (state.token, state.task.take())
        };

        if let Some(previous) = previous {
            previous.abort();
            tracing::debug!("Aborted stream superseded by token {}", token);
        }

        let revoked = self.inner.cache.clear();
        self.inner.diagnostics.record(|s| s.queries_started += 1);
        tracing::info!(
            "Feed query {:?} started (token {}, {} thumbnails released)",
            query,
            token,
            revoked
        );
        self.inner.emit(FeedEvent::QueryStarted {
            token,
            query: query.to_string(),
        });

        let inner = self.inner.clone();
        let query = query.to_string();
        let handle = tokio::spawn(async move { inner.run_stream(token, query).await });

        let mut state = self.inner.state.lock();
        if state.is_streaming(token) {
            state.task = Some(handle);
        } else if state.token != token {
            handle.abort();
        }
        token
    }

    /// Reveal one more page (or the remainder). Returns how many items were added.
    pub fn request_next_page(&self) -> usize {
        let (added, notice) = {
            let mut state = self.inner.state.lock();
            let added = state.page.grow_page();
            state.refresh_more_available();
            (added, state.window_grown())
        };
        if added > 0 {
            tracing::debug!("Window grew by {}", added);
            self.inner.emit(notice);
        }
        added
    }

    /// Re-show a previously rendered window, e.g. when navigating back to the feed
    pub fn restore_window(&self, keys: &[String]) {
        let notice = {
            let mut state = self.inner.state.lock();
            let before = state.page.window().len();
            state.page.restore_window(keys.iter().map(String::as_str));
            state.refresh_more_available();
            (state.page.window().len() > before).then(|| state.window_grown())
        };
        if let Some(notice) = notice {
            self.inner.emit(notice);
        }
    }

    /// Stop the running stream, keeping what has loaded
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if state.phase == FeedPhase::Streaming {
            state.phase = FeedPhase::Completed;
        }
        state.loading = false;
        state.refresh_more_available();
    }

    pub fn window(&self) -> Vec<FeedItem> {
        self.inner.state.lock().page.window().to_vec()
    }

    pub fn buffered(&self) -> usize {
        self.inner.state.lock().page.buffer().len()
    }

    /// Look up a buffered event by id
    pub fn find_event(&self, event_id: &str) -> Option<Event> {
        let state = self.inner.state.lock();
        state
            .page
            .get(event_id)
            .and_then(FeedItem::as_event)
            .cloned()
    }

    pub fn keep_set(&self) -> (HashSet<String>, HashSet<String>) {
        self.inner.state.lock().page.keep_set()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        let state = self.inner.state.lock();
        FeedSnapshot {
            token: state.token,
            query: state.query.clone(),
            phase: state.phase,
            declared_total: state.declared_total,
            loading: state.loading,
            more_available: state.more_available,
            buffered: state.page.buffer().len(),
            visible: state.page.window().to_vec(),
        }
    }

    /// Evict thumbnails of everything no longer displayed
    pub fn run_maintenance_once(&self) -> usize {
        let (events, files) = self.keep_set();
        let revoked = self.inner.cache.evict(&events, &files);
        if revoked > 0 {
            self.inner
                .diagnostics
                .record(|s| s.evicted_handles += revoked as u64);
        }
        revoked
    }

    /// Periodic eviction and stats logging
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let loader = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                loader.run_maintenance_once();
                let stats = loader.diagnostics().snapshot();
                tracing::debug!(
                    items = stats.frames_item,
                    stale = stats.stale_discards,
                    fetches = stats.thumbnail_fetches,
                    failures = stats.thumbnail_failures,
                    pending_loads = loader.diagnostics().pending_loads(),
                    "feed maintenance tick"
                );
            }
        })
    }
}

impl LoaderInner {
    fn emit(&self, event: FeedEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run_stream(&self, token: u64, query: String) {
        let watchdog = tokio::time::sleep(self.watchdog);
        tokio::pin!(watchdog);

        let opened = tokio::select! {
            opened = self.source.open(&query, &self.caller) => opened,
            _ = &mut watchdog => {
                self.finish(token, true);
                return;
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(token, e);
                return;
            }
        };

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if !self.apply(token, message) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        self.fail(token, e);
                        break;
                    }
                    None => {
                        self.fail(token, FeedError::StreamInterrupted);
                        break;
                    }
                },
                _ = &mut watchdog => {
                    self.finish(token, true);
                    break;
                }
            }
        }
    }

    /// Apply one message. Returns false once the stream should stop being read.
    fn apply(&self, token: u64, message: StreamMessage) -> bool {
        let item = match message {
            StreamMessage::Complete => {
                if !self.finish(token, false) {
                    self.diagnostics.record(|s| s.stale_discards += 1);
                }
                return false;
            }
            StreamMessage::Total(total) => {
                let applied = {
                    let mut state = self.state.lock();
                    if state.is_streaming(token) {
                        state.declared_total = Some(total);
                        state.refresh_more_available();
                        true
                    } else {
                        false
                    }
                };
                if !applied {
                    self.diagnostics.record(|s| s.stale_discards += 1);
                    return false;
                }
                self.diagnostics.record(|s| s.frames_total += 1);
                self.emit(FeedEvent::TotalDeclared { token, total });
                return true;
            }
            StreamMessage::Item(item) => item,
        };

        let key = item.key().to_string();
        let raw = item.is_raw();
        let new_thumbnail = item.thumbnail_file_id().map(str::to_string);

        let mut notices = Vec::new();
        let mut stale_thumbnail = false;
        {
            let mut state = self.state.lock();
            if !state.is_streaming(token) {
                drop(state);
                tracing::trace!("Dropping item {} for stale token {}", key, token);
                self.diagnostics.record(|s| s.stale_discards += 1);
                return false;
            }

            let previous_thumbnail = state
                .page
                .get(&key)
                .map(|existing| existing.thumbnail_file_id().map(str::to_string));
            if let Some(previous) = previous_thumbnail {
                stale_thumbnail = previous != new_thumbnail;
            }

            let outcome = state.page.upsert(item);
            let added = state.page.fill_first_page();
            state.refresh_more_available();

            if outcome == (Upsert::Replaced { visible: true }) {
                notices.push(FeedEvent::ItemUpdated {
                    token,
                    key: key.clone(),
                });
            }
            if added > 0 {
                notices.push(state.window_grown());
            }
        }

        if stale_thumbnail {
            self.cache.forget_event(&key);
        }
        self.diagnostics.record(|s| {
            s.frames_item += 1;
            if raw {
                s.raw_items += 1;
            }
        });
        for notice in notices {
            self.emit(notice);
        }
        true
    }

    /// Mark the query finished. Returns false if `token` is not streaming.
    fn finish(&self, token: u64, by_watchdog: bool) -> bool {
        let (more_available, visible, buffered) = {
            let mut state = self.state.lock();
            if !state.is_streaming(token) {
                return false;
            }
            state.phase = FeedPhase::Completed;
            state.loading = false;
            state.refresh_more_available();
            state.task = None;
            (
                state.more_available,
                state.page.window().len(),
                state.page.buffer().len(),
            )
        };

        if by_watchdog {
            tracing::warn!("No complete frame within {:?}, finishing feed", self.watchdog);
            self.diagnostics.record(|s| s.watchdog_fires += 1);
        } else {
            self.diagnostics.record(|s| s.frames_complete += 1);
        }
        self.diagnostics.finalize();

        tracing::info!(
            "Feed complete (token {}): {} visible of {} buffered",
            token,
            visible,
            buffered
        );
        self.emit(FeedEvent::Completed {
            token,
            more_available,
        });
        true
    }

    fn fail(&self, token: u64, error: FeedError) {
        {
            let mut state = self.state.lock();
            if !state.is_streaming(token) {
                return;
            }
            state.phase = FeedPhase::Failed;
            state.loading = false;
            state.refresh_more_available();
            state.task = None;
        }

        tracing::warn!("Feed stream failed (token {}): {}", token, error);
        self.diagnostics.record(|s| s.stream_failures += 1);
        self.emit(FeedEvent::Failed {
            token,
            error: error.to_string(),
        });
    }
}
