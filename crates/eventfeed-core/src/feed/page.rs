//! Feed buffer and visible window for one query.

use std::collections::{HashMap, HashSet};

use crate::streaming::FeedItem;

/// Outcome of ingesting one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Appended,
    Replaced { visible: bool },
}

/// Every result of the current query plus the prefix currently rendered.
///
/// The buffer is deduplicated by key: a repeated key replaces the entry in
/// place, keeping the position of its first occurrence. The window never
/// shrinks until [`FeedPage::reset`], never holds a key twice and is never
/// longer than the buffer.
#[derive(Debug)]
pub struct FeedPage {
    buffer: Vec<FeedItem>,
    positions: HashMap<String, usize>,
    window: Vec<FeedItem>,
    visible: HashSet<String>,
    page_size: usize,
}

impl FeedPage {
    pub fn new(page_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            positions: HashMap::new(),
            window: Vec::new(),
            visible: HashSet::new(),
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn buffer(&self) -> &[FeedItem] {
        &self.buffer
    }

    pub fn window(&self) -> &[FeedItem] {
        &self.window
    }

    pub fn is_visible(&self, key: &str) -> bool {
        self.visible.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<&FeedItem> {
        self.positions.get(key).map(|&i| &self.buffer[i])
    }

    pub fn more_available(&self) -> bool {
        self.window.len() < self.buffer.len()
    }

    /// Clear buffer and window together
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.positions.clear();
        self.window.clear();
        self.visible.clear();
    }

    /// Insert or replace an item by key
    pub fn upsert(&mut self, item: FeedItem) -> Upsert {
        let key = item.key().to_string();

        if let Some(&index) = self.positions.get(&key) {
            let visible = self.visible.contains(&key);
            if visible {
                if let Some(slot) = self.window.iter_mut().find(|w| w.key() == key) {
                    *slot = item.clone();
                }
            }
            self.buffer[index] = item;
            return Upsert::Replaced { visible };
        }

        self.positions.insert(key, self.buffer.len());
        self.buffer.push(item);
        Upsert::Appended
    }

    /// Refill after ingesting an item: up to one page
    pub fn fill_first_page(&mut self) -> usize {
        self.refill(self.page_size)
    }

    /// Grow by one page, or by the remainder if less than a page is left
    pub fn grow_page(&mut self) -> usize {
        self.refill(self.window.len() + self.page_size)
    }

    /// Append not-yet-visible buffer items, in buffer order, until the window
    /// holds `min(target, buffer.len())` items. Returns how many were added.
    pub fn refill(&mut self, target: usize) -> usize {
        let target = target.min(self.buffer.len());
        let mut added = 0;

        for item in &self.buffer {
            if self.window.len() >= target {
                break;
            }
            if self.visible.insert(item.key().to_string()) {
                self.window.push(item.clone());
                added += 1;
            }
        }

        self.pin_first();
        added
    }

    /// Keep the buffer's first item at the top of the window when it is visible
    fn pin_first(&mut self) {
        let Some(first) = self.buffer.first() else {
            return;
        };
        let key = first.key();
        if !self.visible.contains(key) {
            return;
        }
        if let Some(pos) = self.window.iter().position(|w| w.key() == key) {
            if pos > 0 {
                let item = self.window.remove(pos);
                self.window.insert(0, item);
            }
        }
    }

    /// Event ids and thumbnail file ids of everything in the window
    pub fn keep_set(&self) -> (HashSet<String>, HashSet<String>) {
        let events = self.visible.clone();
        let files = self
            .window
            .iter()
            .filter_map(|item| item.thumbnail_file_id().map(str::to_string))
            .collect();
        (events, files)
    }

    /// Restore a window from an earlier session, e.g. when returning to a
    /// previously viewed card. Keys not in the buffer are skipped.
    pub fn restore_window<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            if self.visible.contains(key) {
                continue;
            }
            if let Some(&index) = self.positions.get(key) {
                self.visible.insert(key.to_string());
                self.window.push(self.buffer[index].clone());
            }
        }
        self.pin_first();
    }
}
