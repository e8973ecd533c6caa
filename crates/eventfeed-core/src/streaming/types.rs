use serde_json::Value;

use super::Frame;
use crate::models::Event;

/// Typed message decoded from a search stream frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Declared number of results, for progress display only
    Total(u64),
    Item(FeedItem),
    Complete,
}

/// An entry of the feed buffer.
///
/// Payloads that do not parse as an [`Event`] are kept as `Raw` so they stay
/// visible instead of silently disappearing.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(Event),
    Raw { key: String, payload: String },
}

impl FeedItem {
    /// Identity used for deduplication
    pub fn key(&self) -> &str {
        match self {
            FeedItem::Event(event) => &event.id,
            FeedItem::Raw { key, .. } => key,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            FeedItem::Event(event) => Some(event),
            FeedItem::Raw { .. } => None,
        }
    }

    pub fn thumbnail_file_id(&self) -> Option<&str> {
        self.as_event().and_then(Event::thumbnail_file_id)
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, FeedItem::Raw { .. })
    }
}

/// Turns frames into messages for one stream.
///
/// Raw items without a recoverable id get a synthetic key that is unique
/// within the stream.
#[derive(Debug, Default)]
pub struct ItemDecoder {
    raw_seq: u64,
}

impl ItemDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a frame; unknown frame names and unreadable totals yield `None`
    pub fn decode(&mut self, frame: &Frame) -> Option<StreamMessage> {
        match frame.event.as_str() {
            "total" => match frame.data.trim().parse::<u64>() {
                Ok(count) => Some(StreamMessage::Total(count)),
                Err(_) => {
                    tracing::warn!("Ignoring unreadable total frame: {:?}", frame.data);
                    None
                }
            },
            "item" => Some(StreamMessage::Item(self.decode_item(&frame.data))),
            "complete" => Some(StreamMessage::Complete),
            other => {
                tracing::debug!("Ignoring unknown frame type: {}", other);
                None
            }
        }
    }

    fn decode_item(&mut self, data: &str) -> FeedItem {
        match serde_json::from_str::<Event>(data) {
            Ok(event) => FeedItem::Event(event),
            Err(e) => {
                tracing::warn!("Item payload did not parse as an event, keeping raw: {}", e);
                let key = recover_id(data).unwrap_or_else(|| {
                    self.raw_seq += 1;
                    format!("raw-{}", self.raw_seq)
                });
                FeedItem::Raw {
                    key,
                    payload: data.to_string(),
                }
            }
        }
    }
}

/// Pull an `id` out of a JSON object that failed full event parsing
fn recover_id(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
