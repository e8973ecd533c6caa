//! Shared thumbnail cache.
//!
//! One instance is injected into every component that renders event cards,
//! so a thumbnail fetched for the feed is reused by detail views and modals.
//!
//! Two tiers:
//! - by file id: image handles, shared by every event that points at the file
//! - by event id: what each event currently shows (image or placeholder)
//!
//! The loading map holds file ids with a fetch in flight, each with the
//! events waiting on it. A file id is only fetched by whoever manages to
//! insert it there; the waiters are resolved when that fetch settles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{ImageHandle, ObjectUrls};
use crate::constants::PLACEHOLDER_IMAGE;
use crate::models::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Thumbnail {
    Image(ImageHandle),
    Placeholder,
}

impl Thumbnail {
    pub fn url(&self) -> &str {
        match self {
            Thumbnail::Image(handle) => handle.url(),
            Thumbnail::Placeholder => PLACEHOLDER_IMAGE,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Thumbnail::Placeholder)
    }
}

/// A finished fetch and the waiting events it also resolved
#[derive(Debug, Clone)]
pub struct Settled {
    pub handle: ImageHandle,
    pub waiters: Vec<String>,
}

/// Result of looking an event up in both tiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The event has no thumbnail attachment
    NoThumbnail,
    Cached(Thumbnail),
    /// Another caller is fetching this file id
    InFlight(String),
    Miss(String),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    thumbnail: Thumbnail,
    file_id: Option<String>,
}

#[derive(Debug, Default)]
struct CacheInner {
    by_file: HashMap<String, ImageHandle>,
    by_event: HashMap<String, LocalEntry>,
    /// File id with a fetch in flight -> other events waiting on it
    loading: HashMap<String, Vec<String>>,
    /// Events held open by a modal
    pinned: HashSet<String>,
}

impl CacheInner {
    /// Point the fetching event and every waiter at `thumbnail`, drop the
    /// marker and return the waiters other than the fetching event
    fn settle(&mut self, event_id: &str, file_id: &str, thumbnail: Thumbnail) -> Vec<String> {
        let mut waiters = self.loading.remove(file_id).unwrap_or_default();
        waiters.retain(|w| w != event_id);
        for id in std::iter::once(event_id).chain(waiters.iter().map(String::as_str)) {
            self.by_event.insert(
                id.to_string(),
                LocalEntry {
                    thumbnail: thumbnail.clone(),
                    file_id: Some(file_id.to_string()),
                },
            );
        }
        waiters
    }

    /// Revoke candidates no remaining entry still points at
    fn revoke_unreferenced(&self, urls: &ObjectUrls, candidates: Vec<String>) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let referenced: HashSet<&str> = self
            .by_file
            .values()
            .map(ImageHandle::url)
            .chain(self.by_event.values().filter_map(|e| match &e.thumbnail {
                Thumbnail::Image(handle) => Some(handle.url()),
                Thumbnail::Placeholder => None,
            }))
            .collect();

        let mut revoked = 0;
        for url in candidates {
            if !referenced.contains(url.as_str()) && urls.revoke(&url) {
                revoked += 1;
            }
        }
        revoked
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThumbnailCache {
    inner: Arc<Mutex<CacheInner>>,
    urls: ObjectUrls,
}

impl ThumbnailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_urls(&self) -> &ObjectUrls {
        &self.urls
    }

    /// Check the shared file tier, then the event tier.
    ///
    /// A shared hit is copied into the event tier.
    pub fn lookup(&self, event: &Event) -> Lookup {
        self.lookup_inner(event, false)
    }

    /// Like [`ThumbnailCache::lookup`], but an in-flight result also
    /// registers the event to be resolved when that fetch settles
    pub fn lookup_or_wait(&self, event: &Event) -> Lookup {
        self.lookup_inner(event, true)
    }

    fn lookup_inner(&self, event: &Event, wait: bool) -> Lookup {
        let Some(file_id) = event.thumbnail_file_id() else {
            return Lookup::NoThumbnail;
        };

        let mut inner = self.inner.lock();
        if let Some(handle) = inner.by_file.get(file_id).cloned() {
            let thumbnail = Thumbnail::Image(handle);
            inner.by_event.insert(
                event.id.clone(),
                LocalEntry {
                    thumbnail: thumbnail.clone(),
                    file_id: Some(file_id.to_string()),
                },
            );
            return Lookup::Cached(thumbnail);
        }

        if let Some(entry) = inner.by_event.get(&event.id) {
            if entry.file_id.as_deref() == Some(file_id) {
                return Lookup::Cached(entry.thumbnail.clone());
            }
        }

        match inner.loading.get_mut(file_id) {
            Some(waiters) => {
                if wait && !waiters.contains(&event.id) {
                    waiters.push(event.id.clone());
                }
                Lookup::InFlight(file_id.to_string())
            }
            None => Lookup::Miss(file_id.to_string()),
        }
    }

    /// What the event currently shows, if resolved
    pub fn resolved(&self, event_id: &str) -> Option<Thumbnail> {
        self.inner
            .lock()
            .by_event
            .get(event_id)
            .map(|e| e.thumbnail.clone())
    }

    /// Whether the event shows a real (non-placeholder) image
    pub fn has_image(&self, event_id: &str) -> bool {
        matches!(self.resolved(event_id), Some(Thumbnail::Image(_)))
    }

    pub fn assign_placeholder(&self, event_id: &str, file_id: Option<&str>) {
        self.inner.lock().by_event.insert(
            event_id.to_string(),
            LocalEntry {
                thumbnail: Thumbnail::Placeholder,
                file_id: file_id.map(str::to_string),
            },
        );
    }

    /// Claim the loading marker for `file_id`. Returns false if already claimed.
    pub fn try_begin(&self, file_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.loading.contains_key(file_id) {
            return false;
        }
        inner.loading.insert(file_id.to_string(), Vec::new());
        true
    }

    /// Claim the marker on behalf of `event_id`, or join the waiters of the
    /// fetch already holding it. Returns true if the caller should fetch.
    pub fn try_begin_for(&self, file_id: &str, event_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.loading.get_mut(file_id) {
            Some(waiters) => {
                if !waiters.iter().any(|w| w == event_id) {
                    waiters.push(event_id.to_string());
                }
                false
            }
            None => {
                inner.loading.insert(file_id.to_string(), Vec::new());
                true
            }
        }
    }

    pub fn is_loading(&self, file_id: &str) -> bool {
        self.inner.lock().loading.contains_key(file_id)
    }

    pub fn loading_count(&self) -> usize {
        self.inner.lock().loading.len()
    }

    /// Events currently waiting on another caller's fetch of `file_id`
    pub fn waiters(&self, file_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .loading
            .get(file_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Store fetched bytes in both tiers, resolve the waiters and release the
    /// loading marker
    pub fn complete_success(&self, event_id: &str, file_id: &str, bytes: Bytes) -> Settled {
        let mut inner = self.inner.lock();
        let handle = match inner.by_file.get(file_id) {
            Some(existing) => existing.clone(),
            None => {
                let handle = self.urls.mint(bytes);
                inner.by_file.insert(file_id.to_string(), handle.clone());
                handle
            }
        };
        let waiters = inner.settle(event_id, file_id, Thumbnail::Image(handle.clone()));
        Settled { handle, waiters }
    }

    /// Fall back to the placeholder for the fetching event and its waiters,
    /// and release the loading marker. Returns the waiters.
    pub fn complete_failure(&self, event_id: &str, file_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .settle(event_id, file_id, Thumbnail::Placeholder)
    }

    /// Drop the event-tier entry, e.g. after the event's thumbnail file changed
    pub fn forget_event(&self, event_id: &str) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.by_event.remove(event_id) else {
            return;
        };
        if let Thumbnail::Image(handle) = entry.thumbnail {
            inner.revoke_unreferenced(&self.urls, vec![handle.url().to_string()]);
        }
    }

    pub fn pin_event(&self, event_id: &str) {
        self.inner.lock().pinned.insert(event_id.to_string());
    }

    pub fn unpin_event(&self, event_id: &str) {
        self.inner.lock().pinned.remove(event_id);
    }

    /// Remove and revoke everything outside the keep-set.
    ///
    /// Pinned events, and the files they show, are always kept. Returns the
    /// number of revoked handles.
    pub fn evict(&self, keep_events: &HashSet<String>, keep_files: &HashSet<String>) -> usize {
        let mut inner = self.inner.lock();

        let mut files: HashSet<String> = keep_files.clone();
        for (event_id, entry) in &inner.by_event {
            let kept = keep_events.contains(event_id) || inner.pinned.contains(event_id);
            if let (true, Some(file_id)) = (kept, &entry.file_id) {
                files.insert(file_id.clone());
            }
        }

        let mut candidates = Vec::new();

        let pinned = inner.pinned.clone();
        inner.by_event.retain(|event_id, entry| {
            let keep = keep_events.contains(event_id) || pinned.contains(event_id);
            if !keep {
                if let Thumbnail::Image(handle) = &entry.thumbnail {
                    candidates.push(handle.url().to_string());
                }
            }
            keep
        });
        inner.by_file.retain(|file_id, handle| {
            let keep = files.contains(file_id);
            if !keep {
                candidates.push(handle.url().to_string());
            }
            keep
        });

        candidates.sort();
        candidates.dedup();
        let revoked = inner.revoke_unreferenced(&self.urls, candidates);
        if revoked > 0 {
            tracing::debug!("Evicted {} thumbnail handles", revoked);
        }
        revoked
    }

    /// Revoke and drop every entry. Loading markers stay with their fetches.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut candidates: Vec<String> = inner
            .by_file
            .values()
            .map(|h| h.url().to_string())
            .collect();
        candidates.extend(inner.by_event.values().filter_map(|e| match &e.thumbnail {
            Thumbnail::Image(handle) => Some(handle.url().to_string()),
            Thumbnail::Placeholder => None,
        }));
        inner.by_file.clear();
        inner.by_event.clear();

        candidates.sort();
        candidates.dedup();
        inner.revoke_unreferenced(&self.urls, candidates)
    }

    /// (file-tier entries, event-tier entries)
    pub fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.by_file.len(), inner.by_event.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }
}
