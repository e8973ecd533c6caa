use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::THUMBNAIL_TOKEN;

/// A planned activity record as served by the event API.
///
/// The feed pipeline only looks at `id` and `files`; everything else is
/// carried through untouched for the views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Attachments, including the optional thumbnail
    #[serde(default)]
    pub files: Vec<AttachedFile>,
    #[serde(default)]
    pub links: Vec<EventLink>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Member>,
    #[serde(default)]
    pub members: Vec<Member>,
    /// Descriptive fields this client does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub id: String,
    #[serde(alias = "fileName")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

impl AttachedFile {
    /// Whether the file is marked as a thumbnail by its name
    pub fn is_thumbnail(&self) -> bool {
        self.name.to_lowercase().contains(THUMBNAIL_TOKEN)
    }
}

impl Event {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            location: None,
            start_date: None,
            end_date: None,
            files: Vec::new(),
            links: Vec::new(),
            comments: Vec::new(),
            author: None,
            members: Vec::new(),
            extra: Map::new(),
        }
    }

    /// First attachment whose name contains "thumbnail" (any case)
    pub fn thumbnail_file(&self) -> Option<&AttachedFile> {
        self.files.iter().find(|f| f.is_thumbnail())
    }

    pub fn thumbnail_file_id(&self) -> Option<&str> {
        self.thumbnail_file().map(|f| f.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(id: &str, name: &str) -> AttachedFile {
        AttachedFile {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: None,
            size: None,
        }
    }

    #[test]
    fn test_thumbnail_chosen_by_name() {
        let mut event = Event::new("e1", "Alps Trek");
        event.files = vec![file("f1", "map.png"), file("f2", "trip_thumbnail_01.jpg")];

        assert_eq!(event.thumbnail_file_id(), Some("f2"));
    }

    #[test]
    fn test_thumbnail_match_is_case_insensitive() {
        let mut event = Event::new("e1", "Alps Trek");
        event.files = vec![file("f9", "Cover-THUMBNAIL.PNG")];

        assert_eq!(event.thumbnail_file_id(), Some("f9"));
    }

    #[test]
    fn test_no_thumbnail_file() {
        let mut event = Event::new("e1", "Alps Trek");
        event.files = vec![file("f1", "map.png"), file("f2", "thumb.jpg")];

        assert!(event.thumbnail_file().is_none());
    }

    #[test]
    fn test_deserialize_keeps_unknown_fields() {
        let value = json!({
            "id": "42",
            "name": "Harbour cleanup",
            "startDate": "2026-05-01T09:00:00Z",
            "files": [{"id": "f1", "fileName": "harbour_thumbnail.jpg"}],
            "capacity": 30,
            "visibility": "public"
        });

        let event: Event = serde_json::from_value(value).unwrap();
        assert_eq!(event.id, "42");
        assert_eq!(event.files[0].name, "harbour_thumbnail.jpg");
        assert!(event.start_date.is_some());
        assert_eq!(event.extra.get("capacity"), Some(&json!(30)));
        assert_eq!(event.extra.get("visibility"), Some(&json!("public")));
    }
}
