pub mod loader;
pub mod page;

pub use loader::{FeedLoader, FeedPhase, FeedSnapshot, FeedSource, MessageStream};
pub use page::{FeedPage, Upsert};
