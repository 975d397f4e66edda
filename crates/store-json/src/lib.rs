use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::Utc;
use core_model::{MessageRecord, ThreadLog};
use tracing::warn;

/// Durable home of the per-thread message logs, one JSON file per thread
/// keyed by a filesystem-safe transform of the thread title.
pub struct ThreadStore {
    root: PathBuf,
}

impl ThreadStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(base.join("reelvault").join("messages"))
    }

    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating message store dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn log_path(&self, thread_title: &str) -> PathBuf {
        self.root
            .join(format!("{}_messages.json", sanitize_title(thread_title)))
    }

    /// Loads the persisted log. Absent or unreadable state degrades to
    /// "start fresh" rather than failing the run.
    pub fn load(&self, thread_title: &str) -> (Vec<MessageRecord>, Option<String>) {
        let path = self.log_path(thread_title);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return (Vec::new(), None);
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "could not read thread log; starting fresh");
                return (Vec::new(), None);
            }
        };
        match serde_json::from_str::<ThreadLog>(&content) {
            Ok(log) => (log.messages, log.last_cursor),
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt thread log; starting fresh");
                (Vec::new(), None)
            }
        }
    }

    /// Writes the full log as one self-consistent snapshot: records, the
    /// cursor they were fetched up to, and a fresh export timestamp. The
    /// write goes to a sibling temp file and is renamed into place so an
    /// interruption never leaves a half-written log.
    pub fn persist(
        &self,
        thread_title: &str,
        records: &[MessageRecord],
        cursor: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        let log = ThreadLog {
            thread_title: thread_title.to_string(),
            exported_at: Utc::now(),
            total_messages: records.len(),
            last_cursor: cursor.map(ToOwned::to_owned),
            messages: records.to_vec(),
        };
        let path = self.log_path(thread_title);
        let payload = serde_json::to_vec_pretty(&log)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &payload)
            .with_context(|| format!("writing thread log {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("committing thread log {}", path.display()))?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Thread titles become file names; anything outside a conservative set is
/// flattened to underscores.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
