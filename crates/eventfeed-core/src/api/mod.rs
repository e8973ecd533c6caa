pub mod auth;
pub mod client;

pub use auth::{StaticToken, TokenProvider};
pub use client::ApiClient;
