use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use eventfeed_core::feed::FeedPhase;
use eventfeed_core::streaming::FeedItem;
use eventfeed_core::{ApiClient, FeedEvent, FeedRuntime};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

const THUMBNAIL_WAIT: Duration = Duration::from_secs(30);
const THUMBNAIL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub query: String,
    /// Pages to show, including the first
    pub pages: usize,
    pub thumbnails: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub raw: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReport {
    pub query: String,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_total: Option<u64>,
    pub buffered: usize,
    pub more_available: bool,
    pub cards: Vec<CardView>,
    pub stats: StatsView,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub items: u64,
    pub raw_items: u64,
    pub stale_discards: u64,
    pub thumbnail_fetches: u64,
    pub thumbnail_failures: u64,
    pub thumbnail_cache_hits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_card_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_thumbnail_ms: Option<u64>,
}

/// Run a query to completion, grow the window and optionally resolve thumbnails
pub async fn search(runtime: &FeedRuntime, args: &SearchArgs) -> Result<SearchReport> {
    let mut events = runtime.subscribe();
    let feed = runtime.feed();
    let coordinator = runtime.coordinator();

    coordinator.begin_initial_page();
    let token = feed.reset_and_load(&args.query);

    let mut error = None;
    loop {
        match events.recv().await {
            Ok(FeedEvent::Completed { token: t, .. }) if t == token => break,
            Ok(FeedEvent::Failed { token: t, error: e }) if t == token => {
                error = Some(e);
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                if feed.phase() != FeedPhase::Streaming {
                    break;
                }
            }
            Err(RecvError::Closed) => bail!("Feed event channel closed"),
        }
    }

    for _ in 1..args.pages.max(1) {
        if coordinator.on_sentinel(0.0) == 0 {
            break;
        }
    }

    if args.thumbnails {
        resolve_thumbnails(runtime).await;
    }

    let snapshot = feed.snapshot();
    let cache = feed.cache();
    let cards = snapshot
        .visible
        .iter()
        .map(|item| match item {
            FeedItem::Event(event) => {
                coordinator.card_rendered(&event.id);
                CardView {
                    key: event.id.clone(),
                    name: event.name.clone(),
                    start_date: event.start_date.map(|d| d.to_rfc3339()),
                    thumbnail: cache.resolved(&event.id).map(|t| t.url().to_string()),
                    raw: false,
                }
            }
            FeedItem::Raw { key, payload } => CardView {
                key: key.clone(),
                name: payload.clone(),
                start_date: None,
                thumbnail: None,
                raw: true,
            },
        })
        .collect();

    let stats = feed.diagnostics().snapshot();
    Ok(SearchReport {
        query: snapshot.query,
        completed: snapshot.phase == FeedPhase::Completed,
        error,
        declared_total: snapshot.declared_total,
        buffered: snapshot.buffered,
        more_available: snapshot.more_available,
        cards,
        stats: StatsView {
            items: stats.frames_item,
            raw_items: stats.raw_items,
            stale_discards: stats.stale_discards,
            thumbnail_fetches: stats.thumbnail_fetches,
            thumbnail_failures: stats.thumbnail_failures,
            thumbnail_cache_hits: stats.thumbnail_cache_hits,
            average_card_ms: stats.average_card_time().map(|d| d.as_millis() as u64),
            average_thumbnail_ms: stats.average_thumbnail_time().map(|d| d.as_millis() as u64),
        },
    })
}

/// Request every visible thumbnail and wait until each resolves or the wait expires
async fn resolve_thumbnails(runtime: &FeedRuntime) {
    let feed = runtime.feed();
    let coordinator = runtime.coordinator();

    let ids: Vec<String> = feed
        .window()
        .iter()
        .filter_map(FeedItem::as_event)
        .map(|event| event.id.clone())
        .collect();
    for id in &ids {
        coordinator.on_image_visible(id, 0.0);
    }

    let wait = async {
        while ids.iter().any(|id| feed.cache().resolved(id).is_none()) {
            tokio::time::sleep(THUMBNAIL_POLL).await;
        }
    };
    if tokio::time::timeout(THUMBNAIL_WAIT, wait).await.is_err() {
        tracing::warn!("Gave up waiting for thumbnails after {:?}", THUMBNAIL_WAIT);
    }
}

pub fn print_report(report: &SearchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let total = report
        .declared_total
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{} result(s) for \"{}\" (declared {}), showing {}",
        report.buffered,
        report.query,
        total,
        report.cards.len()
    );
    for card in &report.cards {
        let date = card.start_date.as_deref().unwrap_or("");
        let marker = if card.raw { " [raw]" } else { "" };
        println!("  {:<24} {:<40} {}{}", card.key, card.name, date, marker);
        if let Some(thumbnail) = &card.thumbnail {
            println!("  {:<24} thumbnail: {}", "", thumbnail);
        }
    }
    if report.more_available {
        println!("  … more available");
    }
    if let Some(card_ms) = report.stats.average_card_ms {
        let thumb_ms = report.stats.average_thumbnail_ms.unwrap_or(0);
        println!("  average load: card {} ms, thumbnail {} ms", card_ms, thumb_ms);
    }
    if let Some(error) = &report.error {
        eprintln!("Search failed: {}", error);
    }
    Ok(())
}

pub async fn get_event(client: &ApiClient, event_id: &str) -> Result<()> {
    let event = client
        .get_event(event_id)
        .await
        .with_context(|| format!("Failed to fetch event {}", event_id))?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

pub async fn delete_event(client: &ApiClient, event_id: &str) -> Result<()> {
    client
        .delete_event(event_id)
        .await
        .with_context(|| format!("Failed to delete event {}", event_id))?;
    println!("Deleted {}", event_id);
    Ok(())
}

pub async fn download_file(client: &ApiClient, file_id: &str, output: &Path) -> Result<()> {
    let bytes = client
        .fetch_file(file_id)
        .await
        .with_context(|| format!("Failed to download file {}", file_id))?;
    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}
