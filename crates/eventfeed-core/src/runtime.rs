use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::api::{ApiClient, TokenProvider};
use crate::config::CoreConfig;
use crate::diagnostics::Diagnostics;
use crate::error::FeedError;
use crate::events::FeedEvent;
use crate::feed::FeedLoader;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::thumbnails::{ThumbnailBatchLoader, ThumbnailCache};
use crate::viewport::ScrollCoordinator;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The wired feed pipeline: API client, feed loader, thumbnail loader and
/// scroll coordinator sharing one cache, one diagnostics ledger and one
/// notification channel.
pub struct FeedRuntime {
    client: ApiClient,
    feed: FeedLoader,
    coordinator: ScrollCoordinator,
    events: broadcast::Sender<FeedEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl FeedRuntime {
    /// Build the pipeline. Background tasks start with [`FeedRuntime::start`].
    pub fn new(config: &CoreConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, FeedError> {
        config.validate()?;

        let client = ApiClient::new(config.api_base_url.clone(), tokens);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = ThumbnailCache::new();
        let diagnostics = Diagnostics::new();
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);

        let feed = FeedLoader::new(
            Arc::new(client.clone()),
            config,
            cache.clone(),
            diagnostics.clone(),
            events.clone(),
        );
        let thumbnails = ThumbnailBatchLoader::new(
            cache,
            Arc::new(client.clone()),
            scheduler.clone(),
            config.thumbnail.clone(),
            diagnostics,
            events.clone(),
        );
        let coordinator = ScrollCoordinator::new(
            feed.clone(),
            thumbnails,
            scheduler,
            config.viewport.clone(),
        );

        Ok(Self {
            client,
            feed,
            coordinator,
            events,
            tasks: Vec::new(),
        })
    }

    /// Start the coordinator listener and the maintenance tick
    pub fn start(&mut self, config: &CoreConfig) {
        if !self.tasks.is_empty() {
            return;
        }
        self.tasks.push(self.coordinator.spawn(self.events.subscribe()));
        self.tasks.push(self.feed.spawn_maintenance(config.maintenance_interval()));
        tracing::info!("Feed runtime started against {}", self.client.base_url());
    }

    pub fn feed(&self) -> &FeedLoader {
        &self.feed
    }

    pub fn coordinator(&self) -> &ScrollCoordinator {
        &self.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// Stop streaming and background tasks, and log the loading ledger
    pub fn shutdown(&mut self) {
        self.feed.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let abandoned = self.feed.diagnostics().finalize();
        let stats = self.feed.diagnostics().snapshot();
        tracing::info!(
            completed = stats.completed_loads,
            abandoned,
            fetches = stats.thumbnail_fetches,
            failures = stats.thumbnail_failures,
            "Feed runtime stopped"
        );
    }
}

impl Drop for FeedRuntime {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticToken;

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = CoreConfig {
            page_size: 0,
            ..CoreConfig::default()
        };
        let result = FeedRuntime::new(&config, Arc::new(StaticToken::new("t")));
        assert!(matches!(result, Err(FeedError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_clears_tasks() {
        let config = CoreConfig::default();
        let mut runtime = FeedRuntime::new(&config, Arc::new(StaticToken::new("t"))).unwrap();

        runtime.start(&config);
        runtime.start(&config);
        assert_eq!(runtime.tasks.len(), 2);

        runtime.shutdown();
        assert!(runtime.tasks.is_empty());
        assert_eq!(runtime.feed().window().len(), 0);
    }
}
