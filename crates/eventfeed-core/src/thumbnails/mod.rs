pub mod blob;
pub mod cache;
pub mod loader;

pub use blob::{ImageHandle, ObjectUrls};
pub use cache::{Lookup, Thumbnail, ThumbnailCache};
pub use loader::{FileFetcher, Resolution, ThumbnailBatchLoader};
