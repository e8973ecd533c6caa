//! Locally valid handles to fetched image bytes.
//!
//! A handle is a `blob:<uuid>` URL backed by the bytes it was minted from.
//! It resolves until revoked; revoking releases the bytes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    url: String,
    bytes: Bytes,
}

impl ImageHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// Registry of live object URLs
#[derive(Debug, Clone, Default)]
pub struct ObjectUrls {
    live: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl ObjectUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap opaque bytes in a fresh handle
    pub fn mint(&self, bytes: Bytes) -> ImageHandle {
        let url = format!("blob:{}", uuid::Uuid::new_v4());
        self.live.lock().insert(url.clone(), bytes.clone());
        ImageHandle { url, bytes }
    }

    /// Release a handle; returns false if it was not live
    pub fn revoke(&self, url: &str) -> bool {
        self.live.lock().remove(url).is_some()
    }

    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.live.lock().get(url).cloned()
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.live.lock().contains_key(url)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_resolve_revoke() {
        let urls = ObjectUrls::new();
        let handle = urls.mint(Bytes::from_static(b"jpeg"));

        assert!(handle.url().starts_with("blob:"));
        assert_eq!(urls.resolve(handle.url()).unwrap(), Bytes::from_static(b"jpeg"));
        assert!(urls.revoke(handle.url()));
        assert!(!urls.is_live(handle.url()));
        assert!(!urls.revoke(handle.url()));
    }

    #[test]
    fn test_handles_are_distinct() {
        let urls = ObjectUrls::new();
        let a = urls.mint(Bytes::from_static(b"x"));
        let b = urls.mint(Bytes::from_static(b"x"));

        assert_ne!(a.url(), b.url());
        assert_eq!(urls.live_count(), 2);
    }
}
