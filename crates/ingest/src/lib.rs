use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use core_model::ThreadFeed;
use rand::Rng;
use store_json::ThreadStore;
use tracing::{info, warn};

/// Per-run knobs. Every thread gets its own config so separate instances
/// can sync separate threads without sharing module state.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub thread_id: String,
    /// Identity key of the on-disk log.
    pub thread_title: String,
    pub page_limit: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl SyncConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        let thread_id = thread_id.into();
        Self {
            thread_title: format!("thread_{thread_id}"),
            thread_id,
            page_limit: 100,
            base_delay: Duration::from_millis(500),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// The sync state machine: idle → reconciling → backfilling → complete or
/// aborted. A returned outcome always carries `Complete` or `Aborted`; the
/// earlier states are observable through the `SyncPhase` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Reconciling,
    Backfilling,
    Complete,
    Aborted,
}

/// Progress callback payloads, one per observable step.
#[derive(Debug, Clone)]
pub enum SyncPhase {
    Reconciling,
    Reconciled { new_messages: usize },
    Backfilling { page: usize, total: usize },
    PagePersisted { page: usize, total: usize },
    Complete { total: usize },
    Aborted { total: usize },
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub state: SyncState,
    pub new_messages: usize,
    pub pages_fetched: usize,
    pub total_messages: usize,
}

/// Runs one full sync pass against a thread: a newer-items reconciliation,
/// then the older-items backfill loop. State is persisted after every page
/// so an interruption anywhere leaves a valid, resumable log.
///
/// A login-required feed error aborts the run as a hard error from either
/// phase (the caller must invalidate its cached session); any other feed
/// error is non-fatal in the reconciliation and ends the backfill loop for
/// this run only.
pub fn sync_thread(
    feed: &dyn ThreadFeed,
    store: &ThreadStore,
    config: &SyncConfig,
    cancel: &AtomicBool,
    on_progress: impl Fn(SyncPhase),
) -> anyhow::Result<SyncOutcome> {
    let (mut records, mut cursor) = store.load(&config.thread_title);
    if !records.is_empty() {
        info!(
            thread = %config.thread_title,
            messages = records.len(),
            "resuming from existing log"
        );
    }

    on_progress(SyncPhase::Reconciling);
    let mut new_messages = 0usize;
    match feed.fetch_recent(&config.thread_id) {
        Ok(page) => {
            let known: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
            let mut fresh = Vec::new();
            // Linear early-exit scan over the newest-first page: the first
            // already-known id is the boundary with persisted history, and
            // everything past it was seen in a previous run.
            for item in &page.items {
                if known.contains(normalize::item_id(item).as_str()) {
                    break;
                }
                fresh.push(normalize::normalize_item(item));
            }
            if !fresh.is_empty() {
                new_messages = fresh.len();
                fresh.append(&mut records);
                records = fresh;
                // The recent page's own cursor is deliberately discarded:
                // backfill must continue from the cursor already on disk.
                store.persist(&config.thread_title, &records, cursor.as_deref())?;
            }
            on_progress(SyncPhase::Reconciled { new_messages });
        }
        Err(err) if err.is_auth() => return Err(err.into()),
        Err(err) => {
            warn!(%err, "checking for new messages failed; continuing with backfill");
        }
    }

    let mut state = SyncState::Backfilling;
    let mut pages_fetched = 0usize;
    loop {
        // Cooperative interruption point: always after the previous page's
        // persist, so the on-disk log is a snapshot of a completed step.
        if cancel.load(Ordering::SeqCst) {
            info!(thread = %config.thread_title, "sync interrupted; progress saved");
            state = SyncState::Aborted;
            break;
        }
        let page_no = pages_fetched + 1;
        on_progress(SyncPhase::Backfilling {
            page: page_no,
            total: records.len(),
        });
        let page = match feed.fetch_older(&config.thread_id, cursor.as_deref(), config.page_limit)
        {
            Ok(page) => page,
            Err(err) if err.is_auth() => return Err(err.into()),
            Err(err) => {
                warn!(page = page_no, %err, "backfill page failed; stopping this run");
                state = SyncState::Aborted;
                break;
            }
        };
        if page.items.is_empty() {
            state = SyncState::Complete;
            break;
        }

        let mut known: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        for item in &page.items {
            let rec = normalize::normalize_item(item);
            if known.insert(rec.id.clone()) {
                records.push(rec);
            }
        }
        cursor = page.oldest_cursor;
        store.persist(&config.thread_title, &records, cursor.as_deref())?;
        pages_fetched += 1;
        on_progress(SyncPhase::PagePersisted {
            page: page_no,
            total: records.len(),
        });

        if cursor.is_none() {
            state = SyncState::Complete;
            break;
        }
        pace(config);
    }

    let total_messages = records.len();
    match state {
        SyncState::Complete => on_progress(SyncPhase::Complete {
            total: total_messages,
        }),
        SyncState::Aborted => on_progress(SyncPhase::Aborted {
            total: total_messages,
        }),
        _ => {}
    }
    Ok(SyncOutcome {
        state,
        new_messages,
        pages_fetched,
        total_messages,
    })
}

/// Inter-page pacing: base delay plus bounded random jitter.
fn pace(config: &SyncConfig) {
    let jitter_ms = config.max_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    };
    thread::sleep(config.base_delay + jitter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{FeedError, FeedPage};
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn item(id: &str) -> Value {
        json!({"item_id": id, "user_id": 1, "item_type": "text", "text": id})
    }

    type PageResult = Result<(Vec<Value>, Option<String>), FeedError>;

    struct FakeFeed {
        recent: RefCell<Option<Result<Vec<Value>, FeedError>>>,
        older: RefCell<VecDeque<PageResult>>,
        older_cursors_seen: RefCell<Vec<Option<String>>>,
    }

    impl FakeFeed {
        fn new(recent: Result<Vec<Value>, FeedError>, older: Vec<PageResult>) -> Self {
            Self {
                recent: RefCell::new(Some(recent)),
                older: RefCell::new(older.into()),
                older_cursors_seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl ThreadFeed for FakeFeed {
        fn fetch_recent(&self, _thread_id: &str) -> Result<FeedPage, FeedError> {
            let items = self
                .recent
                .borrow_mut()
                .take()
                .unwrap_or_else(|| Ok(Vec::new()))?;
            Ok(FeedPage {
                items,
                oldest_cursor: None,
            })
        }

        fn fetch_older(
            &self,
            _thread_id: &str,
            cursor: Option<&str>,
            _limit: u32,
        ) -> Result<FeedPage, FeedError> {
            self.older_cursors_seen
                .borrow_mut()
                .push(cursor.map(ToOwned::to_owned));
            let (items, oldest_cursor) = self
                .older
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok((Vec::new(), None)))?;
            Ok(FeedPage {
                items,
                oldest_cursor,
            })
        }
    }

    fn quick_config(store_suffix: &str) -> (SyncConfig, ThreadStore) {
        let mut config = SyncConfig::new("123");
        config.base_delay = Duration::ZERO;
        config.max_jitter = Duration::ZERO;
        let dir = std::env::temp_dir().join(format!(
            "reelvault_ingest_{}_{}",
            std::process::id(),
            store_suffix
        ));
        let _ = std::fs::remove_dir_all(&dir);
        (config, ThreadStore::open(dir).unwrap())
    }

    fn ids(store: &ThreadStore, config: &SyncConfig) -> Vec<String> {
        store
            .load(&config.thread_title)
            .0
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    #[test]
    fn backfill_appends_until_exhaustion() {
        let (config, store) = quick_config("backfill");
        let feed = FakeFeed::new(
            Ok(vec![]),
            vec![
                Ok((vec![item("m3"), item("m2")], Some("c1".to_string()))),
                Ok((vec![item("m1")], None)),
            ],
        );
        let cancel = AtomicBool::new(false);
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.state, SyncState::Complete);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(ids(&store, &config), vec!["m3", "m2", "m1"]);
        let (_, cursor) = store.load(&config.thread_title);
        assert!(cursor.is_none());
    }

    #[test]
    fn newer_item_boundary_merge() {
        let (config, store) = quick_config("boundary");
        // Existing history [A, B, C]; the recent page returns [X, Y, A, B]
        // newest-first. The merge must stop at A and yield [X, Y, A, B, C].
        let existing: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|id| normalize::normalize_item(&item(id)))
            .collect();
        store
            .persist(&config.thread_title, &existing, Some("keep-me"))
            .unwrap();
        let feed = FakeFeed::new(
            Ok(vec![item("X"), item("Y"), item("A"), item("B")]),
            vec![Ok((vec![], None))],
        );
        let cancel = AtomicBool::new(false);
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.new_messages, 2);
        assert_eq!(ids(&store, &config), vec!["X", "Y", "A", "B", "C"]);
    }

    #[test]
    fn reconciliation_keeps_backfill_cursor() {
        let (config, store) = quick_config("cursor_kept");
        let existing = vec![normalize::normalize_item(&item("A"))];
        store
            .persist(&config.thread_title, &existing, Some("keep-me"))
            .unwrap();
        // Phase A finds a new message; phase B then fails on transport.
        let feed = FakeFeed::new(
            Ok(vec![item("X"), item("A")]),
            vec![Err(FeedError::Transport("boom".to_string()))],
        );
        let cancel = AtomicBool::new(false);
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.state, SyncState::Aborted);
        let (records, cursor) = store.load(&config.thread_title);
        assert_eq!(records.len(), 2);
        assert_eq!(cursor.as_deref(), Some("keep-me"));
        // And the backfill request used that cursor, not the recent page's.
        assert_eq!(
            feed.older_cursors_seen.borrow().as_slice(),
            &[Some("keep-me".to_string())]
        );
    }

    #[test]
    fn duplicate_ids_skipped_across_and_within_pages() {
        let (config, store) = quick_config("dedup");
        let feed = FakeFeed::new(
            Ok(vec![]),
            vec![
                Ok((vec![item("a"), item("b"), item("b")], Some("c1".to_string()))),
                Ok((vec![item("b"), item("c")], None)),
            ],
        );
        let cancel = AtomicBool::new(false);
        sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(ids(&store, &config), vec!["a", "b", "c"]);
    }

    #[test]
    fn rerun_after_completion_changes_nothing() {
        let (config, store) = quick_config("idempotent");
        let cancel = AtomicBool::new(false);
        let feed = FakeFeed::new(
            Ok(vec![]),
            vec![
                Ok((vec![item("a"), item("b")], Some("c1".to_string()))),
                Ok((vec![item("c")], None)),
            ],
        );
        sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        let first = ids(&store, &config);

        // Second run re-walks from the top; every item is already known.
        let feed = FakeFeed::new(
            Ok(vec![item("a"), item("b")]),
            vec![
                Ok((vec![item("a"), item("b")], Some("c1".to_string()))),
                Ok((vec![item("c")], None)),
            ],
        );
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.new_messages, 0);
        assert_eq!(ids(&store, &config), first);
    }

    #[test]
    fn resume_after_failure_matches_uninterrupted_run() {
        let (config, store) = quick_config("resume");
        let cancel = AtomicBool::new(false);
        // First run persists page 1 then dies on page 2.
        let feed = FakeFeed::new(
            Ok(vec![]),
            vec![
                Ok((vec![item("a"), item("b")], Some("c1".to_string()))),
                Err(FeedError::Transport("flaky".to_string())),
            ],
        );
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.state, SyncState::Aborted);
        let (_, cursor) = store.load(&config.thread_title);
        assert_eq!(cursor.as_deref(), Some("c1"));

        // Second run resumes from the persisted cursor.
        let feed = FakeFeed::new(Ok(vec![]), vec![Ok((vec![item("c")], None))]);
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.state, SyncState::Complete);
        assert_eq!(
            feed.older_cursors_seen.borrow().as_slice(),
            &[Some("c1".to_string())]
        );
        assert_eq!(ids(&store, &config), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancel_flag_aborts_before_first_page() {
        let (config, store) = quick_config("cancel");
        let feed = FakeFeed::new(Ok(vec![item("x")]), vec![Ok((vec![item("y")], None))]);
        let cancel = AtomicBool::new(true);
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.state, SyncState::Aborted);
        assert_eq!(outcome.pages_fetched, 0);
        // Reconciliation ran before the loop and its result is on disk.
        assert_eq!(ids(&store, &config), vec!["x"]);
    }

    #[test]
    fn recent_check_failure_is_not_fatal() {
        let (config, store) = quick_config("recent_fail");
        let feed = FakeFeed::new(
            Err(FeedError::Transport("down".to_string())),
            vec![Ok((vec![item("a")], None))],
        );
        let cancel = AtomicBool::new(false);
        let outcome = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.state, SyncState::Complete);
        assert_eq!(ids(&store, &config), vec!["a"]);
    }

    #[test]
    fn login_required_propagates_distinctly() {
        let (config, store) = quick_config("auth");
        let feed = FakeFeed::new(
            Err(FeedError::LoginRequired("session expired".to_string())),
            vec![],
        );
        let cancel = AtomicBool::new(false);
        let err = sync_thread(&feed, &store, &config, &cancel, |_| {}).unwrap_err();
        let feed_err = err.downcast_ref::<FeedError>().unwrap();
        assert!(feed_err.is_auth());
    }

    #[test]
    fn progress_phases_reported_in_order() {
        let (config, store) = quick_config("phases");
        let feed = FakeFeed::new(Ok(vec![]), vec![Ok((vec![item("a")], None))]);
        let cancel = AtomicBool::new(false);
        let seen = RefCell::new(Vec::new());
        sync_thread(&feed, &store, &config, &cancel, |phase| {
            seen.borrow_mut().push(format!("{phase:?}"));
        })
        .unwrap();
        let seen = seen.borrow();
        assert!(seen[0].starts_with("Reconciling"));
        assert!(seen.last().unwrap().starts_with("Complete"));
    }
}
