use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::FeedError;

/// Configuration for the feed pipeline.
///
/// Every field has a default, so a partial JSON document (or `{}`) is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Base URL of the backend, without a trailing slash
    pub api_base_url: String,
    /// Identity sent with search requests
    pub caller_id: String,
    pub page_size: usize,
    pub watchdog_secs: u64,
    pub thumbnail: ThumbnailConfig,
    pub viewport: ViewportConfig,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThumbnailConfig {
    pub debounce_ms: u64,
    pub sub_batch_size: usize,
    pub stagger_ms: u64,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewportConfig {
    pub sentinel_margin_px: f64,
    pub image_margin_px: f64,
    pub scroll_threshold_px: f64,
    pub scroll_restore_ceiling_secs: u64,
    pub scroll_restore_attempts: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            caller_id: "anonymous".to_string(),
            page_size: constants::PAGE_SIZE,
            watchdog_secs: constants::STREAM_WATCHDOG_SECS,
            thumbnail: ThumbnailConfig::default(),
            viewport: ViewportConfig::default(),
            maintenance_interval_secs: constants::MAINTENANCE_INTERVAL_SECS,
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            debounce_ms: constants::THUMBNAIL_DEBOUNCE_MS,
            sub_batch_size: constants::THUMBNAIL_SUB_BATCH_SIZE,
            stagger_ms: constants::THUMBNAIL_STAGGER_MS,
            max_concurrent: constants::THUMBNAIL_MAX_CONCURRENT,
        }
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            sentinel_margin_px: constants::SENTINEL_MARGIN,
            image_margin_px: constants::IMAGE_MARGIN,
            scroll_threshold_px: constants::SCROLL_THRESHOLD,
            scroll_restore_ceiling_secs: constants::SCROLL_RESTORE_CEILING_SECS,
            scroll_restore_attempts: constants::SCROLL_RESTORE_ATTEMPTS,
        }
    }
}

impl CoreConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self, FeedError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, FeedError> {
        let config: CoreConfig =
            serde_json::from_str(json).map_err(|e| FeedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the pipeline
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.page_size == 0 {
            return Err(FeedError::Config("pageSize must be at least 1".to_string()));
        }
        if self.thumbnail.sub_batch_size == 0 || self.thumbnail.max_concurrent == 0 {
            return Err(FeedError::Config(
                "thumbnail subBatchSize and maxConcurrent must be at least 1".to_string(),
            ));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(FeedError::Config(
                "maintenanceIntervalSecs must be at least 1".to_string(),
            ));
        }
        if self.api_base_url.is_empty() {
            return Err(FeedError::Config("apiBaseUrl must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl ThumbnailConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

impl ViewportConfig {
    pub fn restore_ceiling(&self) -> Duration {
        Duration::from_secs(self.scroll_restore_ceiling_secs)
    }
}
