pub mod event;

pub use event::{AttachedFile, Comment, Event, EventLink, Member};
