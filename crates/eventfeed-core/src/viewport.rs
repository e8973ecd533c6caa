//! Visibility and scroll coordination.
//!
//! The host view reports viewport signals (sentinel distance, card image
//! distance, raw scroll metrics) and the coordinator decides when to grow the
//! window and which thumbnails to request. After every window change it
//! recomputes its [`Bindings`]: the card the sentinel follows and the cards
//! whose images still need observing.
//!
//! While the initial page is prepared the host's scrolling is suppressed.
//! Suppression is always lifted: by the guard once binding succeeds or the
//! attempts run out, and by a hard ceiling task regardless of either.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ViewportConfig;
use crate::constants::{REBIND_RETRY_DELAY_MS, SCROLL_RETRY_DELAY_MS};
use crate::events::FeedEvent;
use crate::feed::FeedLoader;
use crate::scheduler::{Scheduler, Task};
use crate::thumbnails::{Resolution, ThumbnailBatchLoader};

#[derive(Debug, Default)]
struct LockState {
    suppressed: bool,
    epoch: u64,
}

/// Whether the host document may scroll
#[derive(Debug, Clone, Default)]
pub struct ScrollLock {
    state: Arc<Mutex<LockState>>,
}

impl ScrollLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suppressed(&self) -> bool {
        self.state.lock().suppressed
    }

    pub fn suppress(&self) -> ScrollSuppression {
        let mut state = self.state.lock();
        state.suppressed = true;
        state.epoch += 1;
        ScrollSuppression {
            lock: self.clone(),
            epoch: state.epoch,
            released: false,
        }
    }

    /// Lift any suppression
    pub fn force_release(&self) {
        self.state.lock().suppressed = false;
    }

    fn release_epoch(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch == epoch && state.suppressed {
            state.suppressed = false;
            return true;
        }
        false
    }
}

/// Restores scrolling when released or dropped
#[derive(Debug)]
pub struct ScrollSuppression {
    lock: ScrollLock,
    epoch: u64,
    released: bool,
}

impl ScrollSuppression {
    pub fn release(mut self) {
        self.lock.release_epoch(self.epoch);
        self.released = true;
    }
}

impl Drop for ScrollSuppression {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release_epoch(self.epoch);
        }
    }
}

/// Current observation targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    /// Bumped on every re-bind
    pub generation: u64,
    pub token: u64,
    /// Key of the last visible card; the sentinel sits after it
    pub sentinel_after: Option<String>,
    /// Visible events without a resolved image
    pub image_targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - (self.scroll_top + self.viewport_height)).max(0.0)
    }
}

#[derive(Debug, Default)]
struct CoordState {
    growth_in_flight: bool,
    observers_supported: bool,
    rebind_retry_pending: bool,
    bindings: Bindings,
    /// Cards already reported to diagnostics for the bound token
    seen_cards: HashSet<String>,
}

struct CoordInner {
    feed: FeedLoader,
    thumbnails: ThumbnailBatchLoader,
    scheduler: Arc<dyn Scheduler>,
    config: ViewportConfig,
    scroll: ScrollLock,
    state: Mutex<CoordState>,
}

#[derive(Clone)]
pub struct ScrollCoordinator {
    inner: Arc<CoordInner>,
}

impl ScrollCoordinator {
    pub fn new(
        feed: FeedLoader,
        thumbnails: ThumbnailBatchLoader,
        scheduler: Arc<dyn Scheduler>,
        config: ViewportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordInner {
                feed,
                thumbnails,
                scheduler,
                config,
                scroll: ScrollLock::new(),
                state: Mutex::new(CoordState {
                    observers_supported: true,
                    ..CoordState::default()
                }),
            }),
        }
    }

    pub fn scroll_lock(&self) -> &ScrollLock {
        &self.inner.scroll
    }

    pub fn is_scroll_suppressed(&self) -> bool {
        self.inner.scroll.is_suppressed()
    }

    /// Hosts without intersection support fall back to scroll polling
    pub fn set_observers_supported(&self, supported: bool) {
        self.inner.state.lock().observers_supported = supported;
    }

    pub fn bindings(&self) -> Bindings {
        self.inner.state.lock().bindings.clone()
    }

    /// Recompute observation targets from the current window
    pub fn rebind(&self) -> Bindings {
        let window = self.inner.feed.window();
        let token = self.inner.feed.token();
        let cache = self.inner.thumbnails.cache();

        let sentinel_after = window.last().map(|item| item.key().to_string());
        let image_targets: Vec<String> = window
            .iter()
            .filter_map(|item| item.as_event())
            .filter(|event| !cache.has_image(&event.id))
            .map(|event| event.id.clone())
            .collect();

        let mut new_cards = Vec::new();
        let bindings = {
            let mut state = self.inner.state.lock();
            if state.bindings.token != token {
                state.seen_cards.clear();
            }
            for item in &window {
                if state.seen_cards.insert(item.key().to_string()) {
                    new_cards.push(item.key().to_string());
                }
            }
            state.bindings = Bindings {
                generation: state.bindings.generation + 1,
                token,
                sentinel_after,
                image_targets,
            };
            state.bindings.clone()
        };

        let diagnostics = self.inner.feed.diagnostics();
        for key in &new_cards {
            diagnostics.card_started(key);
        }
        bindings
    }

    /// The host finished rendering a card
    pub fn card_rendered(&self, event_id: &str) {
        self.inner.feed.diagnostics().card_rendered(event_id);
    }

    /// Sentinel reported at `distance` below the viewport (0 or less when on screen)
    pub fn on_sentinel(&self, distance: f64) -> usize {
        if distance > self.inner.config.sentinel_margin_px {
            return 0;
        }
        self.grow()
    }

    /// A card image reported at `distance` below the viewport
    pub fn on_image_visible(&self, event_id: &str, distance: f64) -> Option<Resolution> {
        if distance > self.inner.config.image_margin_px {
            return None;
        }
        if self.inner.thumbnails.cache().has_image(event_id) {
            return None;
        }
        let event = self.inner.feed.find_event(event_id)?;
        Some(self.inner.thumbnails.request(&event))
    }

    /// Polling fallback, only used when intersection observation is unsupported
    pub fn on_scroll(&self, metrics: ScrollMetrics) -> usize {
        if self.inner.state.lock().observers_supported {
            return 0;
        }
        if metrics.distance_from_bottom() > self.inner.config.scroll_threshold_px {
            return 0;
        }
        self.grow()
    }

    fn grow(&self) -> usize {
        {
            let mut state = self.inner.state.lock();
            if state.growth_in_flight {
                return 0;
            }
            state.growth_in_flight = true;
        }

        let added = self.inner.feed.request_next_page();
        self.inner.state.lock().growth_in_flight = false;

        if added > 0 {
            self.rebind();
        }
        added
    }

    /// Suppress scrolling while the first page is bound.
    ///
    /// Binding is attempted up to the configured number of times; scrolling
    /// is restored after the last attempt whatever the outcome, and in any
    /// case once the restore ceiling elapses.
    pub fn begin_initial_page(&self) {
        let guard = self.inner.scroll.suppress();

        let lock = self.inner.scroll.clone();
        let epoch = guard.epoch;
        self.inner.scheduler.submit(
            self.inner.config.restore_ceiling(),
            async move {
                if lock.release_epoch(epoch) {
                    tracing::warn!("Scroll suppression hit its ceiling, restoring");
                }
            }
            .boxed(),
        );

        self.inner
            .scheduler
            .submit(Duration::ZERO, self.clone().bind_attempt(1, guard));
    }

    fn bind_attempt(self, attempt: u32, guard: ScrollSuppression) -> Task {
        async move {
            let bindings = self.rebind();
            let attempts = self.inner.config.scroll_restore_attempts.max(1);
            if bindings.sentinel_after.is_some() || attempt >= attempts {
                tracing::debug!(
                    "Initial page bound after {} attempt(s), restoring scroll",
                    attempt
                );
                guard.release();
                return;
            }
            let scheduler = self.inner.scheduler.clone();
            scheduler.submit(
                Duration::from_millis(SCROLL_RETRY_DELAY_MS),
                self.bind_attempt(attempt + 1, guard),
            );
        }
        .boxed()
    }

    /// Keep an event's thumbnail alive while a modal shows it
    pub fn pin_modal(&self, event_id: &str) {
        self.inner.thumbnails.cache().pin_event(event_id);
    }

    pub fn unpin_modal(&self, event_id: &str) {
        self.inner.thumbnails.cache().unpin_event(event_id);
    }

    /// React to one pipeline notification. Notifications from a superseded
    /// query are ignored.
    pub fn handle_event(&self, event: &FeedEvent) {
        if let Some(token) = event.token() {
            if token != self.inner.feed.token() {
                tracing::trace!("Ignoring {:?} for superseded token {}", event, token);
                return;
            }
        }
        match event {
            FeedEvent::QueryStarted { .. } => {
                self.inner.state.lock().growth_in_flight = false;
                self.rebind();
            }
            FeedEvent::WindowGrown { .. }
            | FeedEvent::ItemUpdated { .. }
            | FeedEvent::Completed { .. }
            | FeedEvent::ThumbnailReady { .. } => {
                self.rebind();
            }
            FeedEvent::Failed { .. } => {
                self.inner.scroll.force_release();
                self.schedule_rebind_retry();
            }
            FeedEvent::TotalDeclared { .. } => {}
        }
    }

    /// One deferred re-bind after a stream failure
    fn schedule_rebind_retry(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.rebind_retry_pending {
                return;
            }
            state.rebind_retry_pending = true;
        }
        let this = self.clone();
        self.inner.scheduler.submit(
            Duration::from_millis(REBIND_RETRY_DELAY_MS),
            async move {
                this.inner.state.lock().rebind_retry_pending = false;
                this.rebind();
            }
            .boxed(),
        );
    }

    /// Consume pipeline notifications until the channel closes
    pub fn spawn(&self, mut events: broadcast::Receiver<FeedEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Coordinator lagged by {} events, re-binding", skipped);
                        this.rebind();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
