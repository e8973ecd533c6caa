use reqwest::StatusCode;

/// Errors raised inside the feed pipeline.
///
/// None of these escape the pipeline as panics or dialogs: stream failures
/// end the query with partial results and thumbnail failures fall back to
/// the placeholder image.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Stream transport error: {0}")]
    StreamTransport(String),

    #[error("Stream interrupted before completion")]
    StreamInterrupted,

    #[error("Thumbnail fetch failed for file {file_id}: {message}")]
    ThumbnailFetch { file_id: String, message: String },

    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
