pub mod api;
pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod feed;
pub mod models;
pub mod runtime;
pub mod scheduler;
pub mod streaming;
pub mod thumbnails;
pub mod viewport;

pub use api::{ApiClient, StaticToken, TokenProvider};
pub use config::CoreConfig;
pub use error::FeedError;
pub use events::FeedEvent;
pub use feed::{FeedLoader, FeedPhase, FeedSnapshot};
pub use models::Event;
pub use runtime::FeedRuntime;
pub use thumbnails::{ThumbnailBatchLoader, ThumbnailCache};
pub use viewport::ScrollCoordinator;
