use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use core_model::{FeedError, FeedPage, ThreadFeed};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "https://i.instagram.com/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "reelvault/0.1";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    /// Opaque session header value provisioned by an external login flow.
    pub session_token: String,
    pub seq_id: String,
    pub timeout: Duration,
}

impl FeedConfig {
    pub fn new(session_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            session_token: session_token.into(),
            seq_id: "40065".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// `ThreadFeed` over the upstream HTTP API. Strictly sequential: one
/// blocking request at a time, no connection fan-out.
pub struct HttpThreadFeed {
    http: reqwest::blocking::Client,
    config: FeedConfig,
}

impl HttpThreadFeed {
    pub fn new(config: FeedConfig) -> Result<Self, FeedError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        Ok(Self { http, config })
    }

    fn fetch(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<FeedPage, FeedError> {
        let url = format!(
            "{}/direct_v2/threads/{}/",
            self.config.base_url.trim_end_matches('/'),
            thread_id
        );
        let mut query: Vec<(&str, String)> = vec![
            ("visual_message_return_type", "unseen".to_string()),
            ("direction", "older".to_string()),
            ("seq_id", self.config.seq_id.clone()),
        ];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.config.session_token)
            .query(&query)
            .send()
            .map_err(|err| FeedError::Transport(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FeedError::LoginRequired(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(FeedError::Transport(format!("status {status}")));
        }

        let body: Value = response
            .json()
            .map_err(|err| FeedError::Decode(err.to_string()))?;
        page_from_body(&body)
    }
}

impl ThreadFeed for HttpThreadFeed {
    fn fetch_recent(&self, thread_id: &str) -> Result<FeedPage, FeedError> {
        self.fetch(thread_id, None, None)
    }

    fn fetch_older(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FeedPage, FeedError> {
        self.fetch(thread_id, cursor, Some(limit))
    }
}

/// Turns a thread response body into a page. The upstream flags failures
/// in-band with `status: "fail"`; a `login_required` message there means
/// the session is stale and the run must stop.
fn page_from_body(body: &Value) -> Result<FeedPage, FeedError> {
    if body.get("status").and_then(Value::as_str) == Some("fail") {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown failure");
        if message.contains("login_required") {
            return Err(FeedError::LoginRequired(message.to_string()));
        }
        return Err(FeedError::Transport(message.to_string()));
    }
    let thread = body.get("thread");
    let items = thread
        .and_then(|t| t.get("items"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let oldest_cursor = thread
        .and_then(|t| t.get("oldest_cursor"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(ToOwned::to_owned);
    Ok(FeedPage {
        items,
        oldest_cursor,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionPayload {
    session_token: String,
}

/// The cached session artifact. Login itself happens elsewhere; this type
/// only loads, stores, and invalidates the cached token so a stale session
/// is retried at most once.
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn default_path() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("reelvault").join("session.json"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<SessionPayload>(&content) {
            Ok(payload) => Some(payload.session_token),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unreadable session file");
                None
            }
        }
    }

    pub fn store(&self, session_token: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating session dir {}", parent.display()))?;
        }
        let payload = SessionPayload {
            session_token: session_token.to_string(),
        };
        fs::write(&self.path, serde_json::to_vec_pretty(&payload)?)
            .with_context(|| format!("writing session file {}", self.path.display()))
    }

    /// Best-effort removal so the next run re-authenticates instead of
    /// looping on a stale session.
    pub fn invalidate(&self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), %err, "could not remove session file");
        }
    }
}
