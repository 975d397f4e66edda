use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;
use chrono::{DateTime, Utc};
use core_model::MessageRecord;
use serde::Serialize;
use tracing::warn;

/// One derived catalog row. Regenerated on every projection run, never
/// persisted independently of its source log.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub url: String,
    pub user: String,
    pub timestamp: Option<DateTime<Utc>>,
}

pub type UserMap = HashMap<String, String>;

/// Loads the external author-id → display-name mapping. Absent or corrupt
/// files degrade to an empty map; every lookup has a synthetic fallback.
pub fn load_user_map(path: &Path) -> UserMap {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), %err, "no user map; falling back to synthetic names");
            return UserMap::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable user map; falling back to synthetic names");
            UserMap::new()
        }
    }
}

pub fn display_user(users: &UserMap, author_id: &str) -> String {
    users
        .get(author_id)
        .cloned()
        .unwrap_or_else(|| format!("User {author_id}"))
}

/// Projects the reel catalog out of a thread's records: one entry per
/// reel-bearing record with a non-empty extracted URL, newest first.
/// Records without a timestamp sort after dated ones.
pub fn project(records: &[MessageRecord], users: &UserMap) -> Vec<CatalogEntry> {
    let mut entries: Vec<CatalogEntry> = records
        .iter()
        .filter(|r| r.kind.is_reel_bearing())
        .filter_map(|r| {
            let url = r.reel_url.as_deref()?;
            if url.is_empty() {
                return None;
            }
            Some(CatalogEntry {
                url: url.to_string(),
                user: display_user(users, &r.author_id),
                timestamp: r.timestamp,
            })
        })
        .collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

/// Renders the catalog as the named assignment the downstream bundler
/// includes verbatim.
pub fn render_js(entries: &[CatalogEntry]) -> anyhow::Result<String> {
    Ok(format!(
        "const reelsData = {};",
        serde_json::to_string_pretty(entries)?
    ))
}

pub fn write_catalog(path: &Path, entries: &[CatalogEntry]) -> anyhow::Result<()> {
    fs::write(path, render_js(entries)?)
        .with_context(|| format!("writing catalog {}", path.display()))
}

/// Summary of reel activity in a thread, for the CLI stats view.
#[derive(Debug, Default)]
pub struct ReelStats {
    pub total_reels: usize,
    /// Author id and reel count, most active first.
    pub by_author: Vec<(String, usize)>,
    pub sample_links: Vec<String>,
}

pub fn reel_stats(records: &[MessageRecord], sample: usize) -> ReelStats {
    let reels: Vec<&MessageRecord> = records
        .iter()
        .filter(|r| r.kind.is_reel_bearing())
        .collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for reel in &reels {
        *counts.entry(reel.author_id.as_str()).or_default() += 1;
    }
    let mut by_author: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(id, n)| (id.to_string(), n))
        .collect();
    by_author.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let sample_links = reels
        .iter()
        .filter_map(|r| r.reel_url.clone())
        .filter(|url| !url.is_empty())
        .take(sample)
        .collect();
    ReelStats {
        total_reels: reels.len(),
        by_author,
        sample_links,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use core_model::ItemKind;

    fn record(id: &str, kind: ItemKind, reel_url: Option<&str>, ts_secs: Option<i64>) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            timestamp: ts_secs.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            author_id: "42".to_string(),
            kind,
            text: Some("caption".to_string()),
            media_url: None,
            reel_code: None,
            reel_url: reel_url.map(ToOwned::to_owned),
            reel_thumbnail_url: None,
        }
    }

    #[test]
    fn only_reel_bearing_kinds_with_urls_project() {
        let records = vec![
            record("1", ItemKind::Clip, Some("https://ig/r1"), Some(100)),
            record("2", ItemKind::Media, Some("https://ig/not-a-reel"), Some(200)),
            record("3", ItemKind::Text, None, Some(300)),
            record("4", ItemKind::ReelShare, None, Some(400)),
            record("5", ItemKind::XmaMediaShare, Some(""), Some(500)),
        ];
        let entries = project(&records, &UserMap::new());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://ig/r1");
    }

    #[test]
    fn entries_sorted_newest_first_missing_timestamps_last() {
        let records = vec![
            record("1", ItemKind::Clip, Some("https://ig/old"), Some(100)),
            record("2", ItemKind::Clip, Some("https://ig/undated"), None),
            record("3", ItemKind::Clip, Some("https://ig/new"), Some(900)),
        ];
        let entries = project(&records, &UserMap::new());
        let urls: Vec<&str> = entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["https://ig/new", "https://ig/old", "https://ig/undated"]);
    }

    #[test]
    fn known_author_gets_display_name() {
        let mut users = UserMap::new();
        users.insert("42".to_string(), "Gabe".to_string());
        let records = vec![record("1", ItemKind::Clip, Some("https://ig/r"), Some(1))];
        let entries = project(&records, &users);
        assert_eq!(entries[0].user, "Gabe");
    }

    #[test]
    fn unknown_author_gets_synthetic_label() {
        let records = vec![record("1", ItemKind::Clip, Some("https://ig/r"), Some(1))];
        let entries = project(&records, &UserMap::new());
        assert_eq!(entries[0].user, "User 42");
    }

    #[test]
    fn render_js_emits_assignment() {
        let entries = vec![CatalogEntry {
            url: "https://ig/r".to_string(),
            user: "Gabe".to_string(),
            timestamp: None,
        }];
        let js = render_js(&entries).unwrap();
        assert!(js.starts_with("const reelsData = ["));
        assert!(js.ends_with("];"));
        assert!(js.contains("\"url\": \"https://ig/r\""));
    }

    #[test]
    fn load_user_map_missing_file_is_empty() {
        let map = load_user_map(Path::new("/nonexistent/users.json"));
        assert!(map.is_empty());
    }

    #[test]
    fn reel_stats_counts_by_author_descending() {
        let mut records = vec![
            record("1", ItemKind::Clip, Some("https://ig/a"), Some(1)),
            record("2", ItemKind::ReelShare, None, Some(2)),
            record("3", ItemKind::Text, None, Some(3)),
        ];
        records[1].author_id = "7".to_string();
        records.push({
            let mut r = record("4", ItemKind::Clip, Some("https://ig/b"), Some(4));
            r.author_id = "7".to_string();
            r
        });
        let stats = reel_stats(&records, 10);
        assert_eq!(stats.total_reels, 3);
        assert_eq!(stats.by_author[0], ("7".to_string(), 2));
        assert_eq!(stats.by_author[1], ("42".to_string(), 1));
        assert_eq!(stats.sample_links.len(), 2);
    }
}
