//! Loading diagnostics for the debug panel.
//!
//! The ledger tracks, per event, when its card started and finished
//! rendering and when its thumbnail started and finished loading. Entries
//! leave the ledger once both phases are done; their durations are folded
//! into [`FeedStats`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug, Default, Clone, Copy)]
struct LedgerEntry {
    card_start: Option<Instant>,
    card_end: Option<Instant>,
    thumb_start: Option<Instant>,
    thumb_end: Option<Instant>,
}

impl LedgerEntry {
    fn durations(&self) -> Option<(Duration, Duration)> {
        let card = self.card_end?.saturating_duration_since(self.card_start?);
        let thumb = self.thumb_end?.saturating_duration_since(self.thumb_start?);
        Some((card, thumb))
    }
}

/// Counters shown in the telemetry panel
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeedStats {
    pub queries_started: u64,
    pub frames_total: u64,
    pub frames_item: u64,
    pub frames_complete: u64,
    pub raw_items: u64,
    pub stale_discards: u64,
    pub stream_failures: u64,
    pub watchdog_fires: u64,
    pub thumbnail_cache_hits: u64,
    pub thumbnail_placeholders: u64,
    pub thumbnail_fetches: u64,
    pub thumbnail_failures: u64,
    pub thumbnail_skipped_in_flight: u64,
    pub evicted_handles: u64,
    pub completed_loads: u64,
    /// Ledger entries dropped unfinished when a query completed
    pub abandoned_loads: u64,
    pub total_card_time: Duration,
    pub total_thumbnail_time: Duration,
}

impl FeedStats {
    pub fn average_card_time(&self) -> Option<Duration> {
        average(self.total_card_time, self.completed_loads)
    }

    pub fn average_thumbnail_time(&self) -> Option<Duration> {
        average(self.total_thumbnail_time, self.completed_loads)
    }
}

fn average(total: Duration, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    Some(total / count)
}

#[derive(Debug, Default)]
struct DiagnosticsInner {
    ledger: HashMap<String, LedgerEntry>,
    stats: FeedStats,
}

/// Thread-safe diagnostics shared by the loader, batch loader and coordinator
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<RwLock<DiagnosticsInner>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump counters
    pub fn record(&self, update: impl FnOnce(&mut FeedStats)) {
        update(&mut self.inner.write().stats);
    }

    pub fn snapshot(&self) -> FeedStats {
        self.inner.read().stats.clone()
    }

    pub fn card_started(&self, event_id: &str) {
        self.touch(event_id, |entry, now| {
            entry.card_start.get_or_insert(now);
        });
    }

    pub fn card_rendered(&self, event_id: &str) {
        self.touch(event_id, |entry, now| {
            entry.card_start.get_or_insert(now);
            entry.card_end = Some(now);
        });
    }

    pub fn thumbnail_started(&self, event_id: &str) {
        self.touch(event_id, |entry, now| {
            entry.thumb_start.get_or_insert(now);
        });
    }

    pub fn thumbnail_finished(&self, event_id: &str) {
        self.touch(event_id, |entry, now| {
            entry.thumb_start.get_or_insert(now);
            entry.thumb_end = Some(now);
        });
    }

    /// Number of events with an unfinished phase
    pub fn pending_loads(&self) -> usize {
        self.inner.read().ledger.len()
    }

    /// Drop every unfinished entry, returning how many there were.
    ///
    /// Runs when a query completes so the ledger does not grow across queries.
    pub fn finalize(&self) -> usize {
        let mut inner = self.inner.write();
        let abandoned = inner.ledger.len();
        inner.ledger.clear();
        inner.stats.abandoned_loads += abandoned as u64;
        if abandoned > 0 {
            tracing::debug!("Dropped {} unfinished load diagnostics", abandoned);
        }
        abandoned
    }

    fn touch(&self, event_id: &str, update: impl FnOnce(&mut LedgerEntry, Instant)) {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let entry = inner.ledger.entry(event_id.to_string()).or_default();
        update(entry, now);

        if let Some((card, thumb)) = entry.durations() {
            inner.ledger.remove(event_id);
            inner.stats.completed_loads += 1;
            inner.stats.total_card_time += card;
            inner.stats.total_thumbnail_time += thumb;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_removed_once_both_phases_complete() {
        let diagnostics = Diagnostics::new();

        diagnostics.card_started("e1");
        diagnostics.thumbnail_started("e1");
        diagnostics.card_rendered("e1");
        assert_eq!(diagnostics.pending_loads(), 1);

        diagnostics.thumbnail_finished("e1");
        assert_eq!(diagnostics.pending_loads(), 0);
        assert_eq!(diagnostics.snapshot().completed_loads, 1);
        assert!(diagnostics.snapshot().average_card_time().is_some());
        assert!(diagnostics.snapshot().average_thumbnail_time().is_some());
    }

    #[test]
    fn test_instant_thumbnail_counts_as_complete() {
        let diagnostics = Diagnostics::new();

        diagnostics.card_rendered("e1");
        diagnostics.thumbnail_finished("e1");

        assert_eq!(diagnostics.pending_loads(), 0);
        assert_eq!(diagnostics.snapshot().completed_loads, 1);
    }

    #[test]
    fn test_finalize_drops_unfinished() {
        let diagnostics = Diagnostics::new();
        diagnostics.card_started("e1");
        diagnostics.thumbnail_started("e2");

        assert_eq!(diagnostics.finalize(), 2);
        assert_eq!(diagnostics.pending_loads(), 0);
        assert_eq!(diagnostics.snapshot().abandoned_loads, 2);
    }

    #[test]
    fn test_record_counters() {
        let diagnostics = Diagnostics::new();
        diagnostics.record(|s| s.stale_discards += 2);
        diagnostics.record(|s| s.stale_discards += 1);

        assert_eq!(diagnostics.snapshot().stale_discards, 3);
        assert_eq!(diagnostics.snapshot().average_card_time(), None);
        assert_eq!(diagnostics.snapshot().average_thumbnail_time(), None);
    }
}
