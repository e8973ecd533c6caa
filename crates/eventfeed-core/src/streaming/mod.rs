pub mod frame;
pub mod types;

pub use frame::{Frame, FrameParser};
pub use types::{FeedItem, ItemDecoder, StreamMessage};
