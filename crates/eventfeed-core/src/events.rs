/// Notifications broadcast by the feed pipeline to views and the scroll coordinator.
///
/// Every feed notification carries the request token of the query it belongs
/// to, so consumers can drop anything from a superseded query.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A new query started; buffer, window and thumbnail cache were cleared
    QueryStarted { token: u64, query: String },
    /// Server declared how many results to expect
    TotalDeclared { token: u64, total: u64 },
    /// Items were added to the visible window
    WindowGrown { token: u64, visible: usize, buffered: usize },
    /// A visible item was replaced in place
    ItemUpdated { token: u64, key: String },
    /// The query finished, by `complete` frame or by watchdog
    Completed { token: u64, more_available: bool },
    /// The stream failed; partial results stay visible
    Failed { token: u64, error: String },
    /// A thumbnail resolved (to an image or the placeholder)
    ThumbnailReady { event_id: String },
}

impl FeedEvent {
    pub fn token(&self) -> Option<u64> {
        match self {
            FeedEvent::QueryStarted { token, .. }
            | FeedEvent::TotalDeclared { token, .. }
            | FeedEvent::WindowGrown { token, .. }
            | FeedEvent::ItemUpdated { token, .. }
            | FeedEvent::Completed { token, .. }
            | FeedEvent::Failed { token, .. } => Some(*token),
            FeedEvent::ThumbnailReady { .. } => None,
        }
    }
}
