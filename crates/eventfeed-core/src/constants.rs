//! Pipeline-wide constants
//!
//! Defaults for every tunable in `CoreConfig`. Durations are kept as plain
//! integers so they can be reused as serde defaults.

/// Number of events revealed per page of the visible window
pub const PAGE_SIZE: usize = 8;

/// Query sent to the search stream when the filter is empty
pub const WILDCARD_QUERY: &str = "*";

/// Seconds to wait for a `complete` frame before treating the stream as finished
pub const STREAM_WATCHDOG_SECS: u64 = 10;

/// Case-insensitive token that marks an attachment as an event's thumbnail
pub const THUMBNAIL_TOKEN: &str = "thumbnail";

/// Handle served for events without a usable thumbnail
pub const PLACEHOLDER_IMAGE: &str = "assets/images/event-placeholder.png";

// Thumbnail batching
pub const THUMBNAIL_DEBOUNCE_MS: u64 = 200;
pub const THUMBNAIL_SUB_BATCH_SIZE: usize = 5;
pub const THUMBNAIL_STAGGER_MS: u64 = 100;
pub const THUMBNAIL_MAX_CONCURRENT: usize = 3;

// Viewport look-ahead margins, in layout units
pub const SENTINEL_MARGIN: f64 = 300.0;
pub const IMAGE_MARGIN: f64 = 200.0;
/// Distance from the bottom of the document that triggers the polling fallback
pub const SCROLL_THRESHOLD: f64 = 500.0;

/// Hard ceiling after which scroll suppression is lifted unconditionally
pub const SCROLL_RESTORE_CEILING_SECS: u64 = 3;
/// Binding attempts made while preparing the initial page
pub const SCROLL_RESTORE_ATTEMPTS: u32 = 3;
/// Delay between binding attempts while preparing the initial page
pub const SCROLL_RETRY_DELAY_MS: u64 = 100;

/// Delay before the single observer re-bind that follows a stream failure
pub const REBIND_RETRY_DELAY_MS: u64 = 500;

/// Interval of the maintenance tick that evicts thumbnails and logs stats
pub const MAINTENANCE_INTERVAL_SECS: u64 = 5;

// HTTP API paths, relative to the configured base URL
pub mod paths {
    pub const EVENTS: &str = "/api/events";
    pub const EVENT_STREAM: &str = "/api/events/stream";
    pub const FILES: &str = "/api/files";
}
