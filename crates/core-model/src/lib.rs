use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Upstream item type tag. Unrecognized tags are carried verbatim so a
/// record can always say what the source called it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemKind {
    Text,
    Clip,
    Media,
    ReelShare,
    XmaMediaShare,
    Other(String),
}

impl ItemKind {
    pub fn as_str(&self) -> &str {
        match self {
            ItemKind::Text => "text",
            ItemKind::Clip => "clip",
            ItemKind::Media => "media",
            ItemKind::ReelShare => "reel_share",
            ItemKind::XmaMediaShare => "xma_media_share",
            ItemKind::Other(tag) => tag,
        }
    }

    /// Kinds that can carry a shared reel link.
    pub fn is_reel_bearing(&self) -> bool {
        matches!(
            self,
            ItemKind::Clip | ItemKind::ReelShare | ItemKind::XmaMediaShare
        )
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ItemKind {
    fn from(s: &str) -> Self {
        match s {
            "text" => ItemKind::Text,
            "clip" => ItemKind::Clip,
            "media" => ItemKind::Media,
            "reel_share" => ItemKind::ReelShare,
            "xma_media_share" => ItemKind::XmaMediaShare,
            other => ItemKind::Other(other.to_string()),
        }
    }
}

impl From<String> for ItemKind {
    fn from(s: String) -> Self {
        ItemKind::from(s.as_str())
    }
}

impl From<ItemKind> for String {
    fn from(kind: ItemKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One normalized chat item. `id` is the sole dedup key within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub author_id: String,
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_thumbnail_url: Option<String>,
}

/// Persisted per-thread state: the full record log plus the backfill cursor.
///
/// `last_cursor` is `None` both before the first backfill page and once the
/// history is exhausted; re-walking a finished log is harmless because every
/// item dedups against `messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadLog {
    pub thread_title: String,
    pub exported_at: DateTime<Utc>,
    pub total_messages: usize,
    #[serde(default)]
    pub last_cursor: Option<String>,
    pub messages: Vec<MessageRecord>,
}

/// One page of raw upstream items, newest-first as the source returns them.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub items: Vec<Value>,
    pub oldest_cursor: Option<String>,
}

/// Collaborator contract for the paginated thread API.
pub trait ThreadFeed {
    /// Fetch the single most-recent page, no cursor attached.
    fn fetch_recent(&self, thread_id: &str) -> Result<FeedPage, FeedError>;

    /// Fetch one page in the "older" direction from `cursor`.
    fn fetch_older(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FeedPage, FeedError>;
}

/// Feed failures. `LoginRequired` is fatal to the run and tells the caller
/// to invalidate any cached session artifact; the rest are transient for
/// already-persisted progress.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("login required: {0}")]
    LoginRequired(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed feed response: {0}")]
    Decode(String),
}

impl FeedError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FeedError::LoginRequired(_))
    }
}

/// Stable id for items the source did not assign one to.
pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}
