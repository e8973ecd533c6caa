use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{RequestBuilder, Response, Url};

use super::TokenProvider;
use crate::constants::{paths, WILDCARD_QUERY};
use crate::error::FeedError;
use crate::feed::{FeedSource, MessageStream};
use crate::models::Event;
use crate::streaming::{FrameParser, ItemDecoder};
use crate::thumbnails::FileFetcher;

/// HTTP client for the event backend
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http: reqwest::Client::new(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}{collection}/{id}` with `id` percent-encoded as a single segment
    fn resource_url(&self, collection: &str, id: &str) -> Result<Url, FeedError> {
        let invalid = |reason: String| FeedError::Config(format!("invalid API URL: {}", reason));
        let mut url = Url::parse(&self.url(collection)).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid(self.base_url.clone()))?
            .push(id);
        Ok(url)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, FeedError> {
        let token = self.tokens.token().await?;
        Ok(builder.header(AUTHORIZATION, format!("Bearer {}", token)))
    }

    /// Open the search stream for `query` and decode it into typed messages.
    ///
    /// An empty query searches everything. Connection and transport failures
    /// surface as `FeedError::StreamTransport`.
    pub async fn open_search_stream(
        &self,
        query: &str,
        caller: &str,
    ) -> Result<MessageStream, FeedError> {
        let query = if query.trim().is_empty() {
            WILDCARD_QUERY
        } else {
            query.trim()
        };

        let request = self
            .http
            .get(self.url(paths::EVENT_STREAM))
            .query(&[("q", query), ("caller", caller)])
            .header(ACCEPT, "text/event-stream");
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|e| FeedError::StreamTransport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::StreamTransport(format!(
                "search stream rejected ({}): {}",
                status, body
            )));
        }

        tracing::debug!("Search stream opened for query {:?}", query);

        let mut body = response.bytes_stream();
        let messages = async_stream::stream! {
            let mut parser = FrameParser::new();
            let mut decoder = ItemDecoder::new();

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for frame in parser.push(&bytes) {
                            if let Some(message) = decoder.decode(&frame) {
                                yield Ok(message);
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(FeedError::StreamTransport(e.to_string()));
                        return;
                    }
                }
            }

            if let Some(frame) = parser.finish() {
                if let Some(message) = decoder.decode(&frame) {
                    yield Ok(message);
                }
            }
        };

        Ok(messages.boxed())
    }

    /// Download the raw bytes of an attached file
    pub async fn fetch_file(&self, file_id: &str) -> Result<Bytes, FeedError> {
        let url = self.resource_url(paths::FILES, file_id)?;
        let response = self.authorized(self.http.get(url)).await?.send().await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Event, FeedError> {
        let url = self.resource_url(paths::EVENTS, event_id)?;
        let response = self.authorized(self.http.get(url)).await?.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn create_event(&self, event: &Event) -> Result<Event, FeedError> {
        let request = self.http.post(self.url(paths::EVENTS)).json(event);
        let response = self.authorized(request).await?.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn update_event(&self, event: &Event) -> Result<Event, FeedError> {
        let url = self.resource_url(paths::EVENTS, &event.id)?;
        let request = self.http.put(url).json(event);
        let response = self.authorized(request).await?.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<(), FeedError> {
        let url = self.resource_url(paths::EVENTS, event_id)?;
        let response = self.authorized(self.http.delete(url)).await?.send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, FeedError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(FeedError::Http { status, body })
}

impl FeedSource for ApiClient {
    fn open(
        &self,
        query: &str,
        caller: &str,
    ) -> BoxFuture<'static, Result<MessageStream, FeedError>> {
        let client = self.clone();
        let query = query.to_string();
        let caller = caller.to_string();
        async move { client.open_search_stream(&query, &caller).await }.boxed()
    }
}

impl FileFetcher for ApiClient {
    fn fetch(&self, file_id: &str) -> BoxFuture<'static, Result<Bytes, FeedError>> {
        let client = self.clone();
        let file_id = file_id.to_string();
        async move {
            client
                .fetch_file(&file_id)
                .await
                .map_err(|e| FeedError::ThumbnailFetch {
                    file_id: file_id.clone(),
                    message: e.to_string(),
                })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticToken;
    use crate::streaming::{FeedItem, StreamMessage};
    use axum::extract::{Path, Query};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    const TOKEN: &str = "secret-token";

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", TOKEN))
            .unwrap_or(false)
    }

    async fn stream_handler(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, "no token").into_response();
        }
        let query = params.get("q").cloned().unwrap_or_default();
        let body = format!(
            "event: total\ndata: 2\n\n\
             event: item\ndata: {{\"id\":\"e1\",\"name\":\"{query}\"}}\n\n\
             event: item\ndata: broken\n\n\
             event: complete\ndata: ok"
        );
        ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
    }

    async fn file_handler(headers: HeaderMap, Path(id): Path<String>) -> impl IntoResponse {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, "no token").into_response();
        }
        if id == "missing" {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        vec![0x89u8, b'P', b'N', b'G'].into_response()
    }

    async fn event_handler(Path(id): Path<String>) -> Json<Event> {
        Json(Event::new(id, "Harbour cleanup"))
    }

    async fn delete_handler(Path(id): Path<String>) -> StatusCode {
        if id == "a/b" {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/api/events/stream", get(stream_handler))
            .route("/api/events/:id", get(event_handler).delete(delete_handler))
            .route("/api/files/:id", get(file_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base: &str, token: &str) -> ApiClient {
        ApiClient::new(base, Arc::new(StaticToken::new(token)))
    }

    #[tokio::test]
    async fn test_search_stream_decodes_frames() {
        let base = spawn_server().await;
        let api = client(&base, TOKEN);

        let stream = api.open_search_stream("", "tester").await.unwrap();
        let messages: Vec<_> = stream.map(|m| m.unwrap()).collect().await;

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], StreamMessage::Total(2));
        match &messages[1] {
            StreamMessage::Item(FeedItem::Event(event)) => {
                // empty query is sent as the wildcard
                assert_eq!(event.name, "*");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(&messages[2], StreamMessage::Item(item) if item.is_raw()));
        assert_eq!(messages[3], StreamMessage::Complete);
    }

    #[tokio::test]
    async fn test_search_stream_rejected_without_token() {
        let base = spawn_server().await;
        let api = client(&base, "wrong");

        let result = api.open_search_stream("alps", "tester").await;
        assert!(matches!(result, Err(FeedError::StreamTransport(_))));
    }

    #[tokio::test]
    async fn test_fetch_file_bytes_and_errors() {
        let base = spawn_server().await;
        let api = client(&base, TOKEN);

        let bytes = api.fetch_file("f1").await.unwrap();
        assert_eq!(&bytes[..], &[0x89, b'P', b'N', b'G']);

        let err = FileFetcher::fetch(&api, "missing").await.unwrap_err();
        match err {
            FeedError::ThumbnailFetch { file_id, message } => {
                assert_eq!(file_id, "missing");
                assert!(message.contains("404"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_event() {
        let base = spawn_server().await;
        let api = client(&format!("{}/", base), TOKEN);

        let event = api.get_event("e42").await.unwrap();
        assert_eq!(event.id, "e42");
        assert_eq!(event.name, "Harbour cleanup");
    }

    #[tokio::test]
    async fn test_ids_are_sent_as_one_path_segment() {
        let base = spawn_server().await;
        let api = client(&base, TOKEN);

        let event = api.get_event("a/b?c#d").await.unwrap();
        assert_eq!(event.id, "a/b?c#d");

        // would hit event "a" if the slash were not escaped
        api.delete_event("a/b").await.unwrap();
        let err = api.delete_event("a").await.unwrap_err();
        assert!(matches!(err, FeedError::Http { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_resource_url_encodes_reserved_characters() {
        let api = client("http://localhost:8080/", TOKEN);
        let url = api.resource_url(paths::FILES, "dir/cover 1.png").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/files/dir%2Fcover%201.png");
    }
}
